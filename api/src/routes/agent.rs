//! `POST /api/agent`: forward one chat turn upstream and normalize the reply.
//!
//! Request lifecycle:
//!
//! ```text
//! Received → Validated → Identified → Dispatched → Decoded → Normalized → Responded
//!     └──────────┴────────────┴────────────┴───────────┴───────────┴──→ Failed(kind)
//! ```
//!
//! Every state can fail and every failure resolves to a JSON
//! [`ResponseEnvelope`]. Client and configuration errors answer at the point
//! they are detected, decoder trouble is contained around the decode step,
//! and anything else (transport errors, panics) is caught once by
//! [`agent_post`] itself.

use std::panic::{AssertUnwindSafe, UnwindSafe};

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use chrono::{SecondsFormat, Utc};
use futures::FutureExt;
use pitlane_core::decode::{DecodeFailure, decode};
use pitlane_core::envelope::{NormalizedEnvelope, ResponseEnvelope, truncate_chars};
use pitlane_core::error::{messages, upstream_status_message};
use pitlane_core::identity::Identity;
use pitlane_core::normalize::{is_falsy, normalize_with_rule};
use serde::Serialize;
use serde_json::{Value, json};

use crate::containment::{self, Fault};
use crate::error::AppError;
use crate::middleware::rate_limit::RateLimitLayer;
use crate::state::AppState;
use crate::upstream::UpstreamReply;

pub const AGENT_PATH: &str = "/api/agent";
/// Largest request body buffered by `POST /api/agent`.
pub const AGENT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Raw text echoed back when the decoder reports a failure marker.
const MARKER_RAW_LIMIT: usize = 1000;
/// Raw text echoed back when decoding itself blew up.
const FAULT_RAW_LIMIT: usize = 500;

/// `POST` and `GET` on [`AGENT_PATH`]. The limiter, when given, only guards
/// `POST`; health probes are never throttled.
pub fn router(limiter: Option<RateLimitLayer>) -> Router<AppState> {
    let send = match limiter {
        Some(layer) => post(agent_post).layer(layer),
        None => post(agent_post),
    };
    Router::new()
        .route(AGENT_PATH, send.get(agent_health))
        .layer(DefaultBodyLimit::max(AGENT_BODY_LIMIT))
}

/// Documented request body, schema only. The handler reads the raw bytes
/// itself so that malformed JSON still yields an envelope instead of an
/// extractor rejection.
#[derive(Debug, utoipa::ToSchema)]
pub struct AgentRequestBody {
    pub message: String,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    #[schema(value_type = Option<Vec<Object>>)]
    pub assets: Option<Vec<Value>>,
}

/// A validated chat turn.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub message: String,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub assets: Vec<Value>,
}

impl InferenceRequest {
    /// Read the request fields out of an already parsed body.
    ///
    /// `message` and `agent_id` must be non-empty strings. Optional fields of
    /// the wrong type are ignored.
    pub fn from_body(body: &Value) -> Result<Self, AppError> {
        let (Some(message), Some(agent_id)) =
            (non_empty_str(body, "message"), non_empty_str(body, "agent_id"))
        else {
            return Err(AppError::MissingFields);
        };

        Ok(Self {
            message,
            agent_id,
            user_id: non_empty_str(body, "user_id"),
            session_id: non_empty_str(body, "session_id"),
            assets: body
                .get("assets")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Outbound body; `assets` only when there is at least one.
    pub fn upstream_payload(&self, identity: &Identity) -> Value {
        let mut payload = json!({
            "message": self.message,
            "agent_id": self.agent_id,
            "user_id": identity.user_id,
            "session_id": identity.session_id,
        });
        if !self.assets.is_empty() {
            payload["assets"] = Value::Array(self.assets.clone());
        }
        payload
    }
}

fn non_empty_str(body: &Value, field: &str) -> Option<String> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Send a message to an agent
///
/// Always answers with JSON. `success` tells whether the upstream reply was
/// obtained and understood; `response` is the normalized agent reply.
#[utoipa::path(
    post,
    path = "/api/agent",
    request_body = AgentRequestBody,
    responses(
        (status = 200, description = "Agent replied (check `success` for decode failures)", body = ResponseEnvelope),
        (status = 400, description = "Malformed body or missing message/agent_id", body = ResponseEnvelope),
        (status = 413, description = "Request body too large", body = ResponseEnvelope),
        (status = 429, description = "Rate limited", body = ResponseEnvelope),
        (status = 500, description = "Server misconfigured or unexpected failure", body = ResponseEnvelope)
    ),
    tag = "agent"
)]
pub async fn agent_post(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let expose_trace = state.config.exposes_fault_traces();

    match AssertUnwindSafe(handle_agent_request(state, body))
        .catch_unwind()
        .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(err)) if err.is_fault() => {
            containment::fault_response(Fault::from(err), expose_trace)
        }
        Ok(Err(err)) => err.into_response(),
        Err(panic) => containment::fault_response(Fault::from_panic(panic), expose_trace),
    }
}

async fn handle_agent_request(
    state: AppState,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, AppError> {
    let body = body.map_err(AppError::UnreadableBody)?;
    let body: Value = serde_json::from_slice(&body).map_err(AppError::InvalidBody)?;
    let request = InferenceRequest::from_body(&body)?;

    let api_key = state
        .config
        .api_key
        .as_deref()
        .ok_or(AppError::NotConfigured)?;

    let identity = Identity::resolve(
        &request.agent_id,
        request.user_id.as_deref(),
        request.session_id.as_deref(),
    );

    tracing::info!(
        event = "agent_request_dispatched",
        agent_id = %request.agent_id,
        user_id = %identity.user_id,
        session_id = %identity.session_id,
        assets = request.assets.len(),
        "Forwarding agent request upstream"
    );

    // Transport errors propagate to the containment in `agent_post`.
    let reply = state
        .transport
        .send(api_key, &request.upstream_payload(&identity))
        .await?;

    tracing::debug!(
        status = reply.status,
        bytes = reply.body.len(),
        "Upstream reply received"
    );

    if !reply.is_ok() {
        return upstream_failure(reply);
    }

    let outcome = reply_outcome(&reply.body, classify_reply);
    let envelope = outcome_envelope(outcome, &request, &identity, reply.body);
    Ok(containment::render(StatusCode::OK, &envelope)?)
}

/// Non-2xx upstream status: echo the status with the best message we can find.
fn upstream_failure(reply: UpstreamReply) -> Result<Response, AppError> {
    let message = upstream_error_message(&reply.body)
        .unwrap_or_else(|| upstream_status_message(reply.status));

    let status = StatusCode::from_u16(reply.status)
        .ok()
        .filter(|status| status.is_client_error() || status.is_server_error())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    tracing::warn!(
        event = "agent_upstream_error",
        upstream_status = reply.status,
        error = %message,
        "Upstream returned non-success status"
    );

    let envelope = ResponseEnvelope::failure(message).with_raw_response(reply.body);
    Ok(containment::render(status, &envelope)?)
}

/// Error text from a failed upstream body: `error` (or `error.message`),
/// then `detail`, then `message`.
fn upstream_error_message(raw: &str) -> Option<String> {
    let decoded = decode(raw)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(raw).ok())?;
    let object = decoded.as_object()?;

    let text = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    };

    text(object.get("error"))
        .or_else(|| text(object.get("error").and_then(|err| err.get("message"))))
        .or_else(|| text(object.get("detail")))
        .or_else(|| text(object.get("message")))
}

type Classified = (NormalizedEnvelope, &'static str);

/// What became of a 2xx upstream body.
#[derive(Debug)]
enum ReplyOutcome {
    Normalized(Classified),
    /// Decoder (or the agent itself) reported a failure marker.
    Rejected(DecodeFailure),
    /// Decoding or normalization panicked.
    Faulted(String),
}

/// Decode, then normalize. A falsy decoded value (`null`, `""`, `0`, `false`)
/// or a `{"success": false}` body counts as a failure marker.
fn classify_reply(raw: &str) -> Result<Classified, DecodeFailure> {
    let value = decode(raw)?;
    if is_falsy(&value) {
        return Err(DecodeFailure::new(messages::PARSE_FAILED));
    }
    if let Some(marker) = DecodeFailure::from_marker(&value) {
        return Err(marker);
    }
    Ok(normalize_with_rule(&value))
}

/// Run `classify` with its panics contained to this step.
fn reply_outcome<F>(raw: &str, classify: F) -> ReplyOutcome
where
    F: FnOnce(&str) -> Result<Classified, DecodeFailure> + UnwindSafe,
{
    match std::panic::catch_unwind(move || classify(raw)) {
        Ok(Ok(classified)) => ReplyOutcome::Normalized(classified),
        Ok(Err(failure)) => ReplyOutcome::Rejected(failure),
        Err(panic) => ReplyOutcome::Faulted(containment::panic_message(panic.as_ref())),
    }
}

fn outcome_envelope(
    outcome: ReplyOutcome,
    request: &InferenceRequest,
    identity: &Identity,
    raw: String,
) -> ResponseEnvelope {
    match outcome {
        ReplyOutcome::Normalized((response, rule)) => {
            tracing::info!(
                event = "agent_reply_normalized",
                agent_id = %request.agent_id,
                rule,
                status = ?response.status,
                "Agent reply normalized"
            );
            ResponseEnvelope::completed(
                response,
                &request.agent_id,
                identity,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                raw,
            )
        }
        ReplyOutcome::Rejected(failure) => {
            tracing::warn!(
                event = "agent_reply_rejected",
                agent_id = %request.agent_id,
                error = %failure,
                "Agent reply could not be decoded"
            );
            ResponseEnvelope::failure(failure.error)
                .with_raw_response(truncate_chars(&raw, MARKER_RAW_LIMIT))
        }
        ReplyOutcome::Faulted(description) => {
            tracing::error!(
                event = "agent_reply_fault",
                agent_id = %request.agent_id,
                error = %description,
                "Decoding agent reply panicked"
            );
            ResponseEnvelope::failure(format!("JSON parsing error: {description}"))
                .with_error(messages::PARSE_FAULT)
                .with_details(description)
                .with_raw_response(truncate_chars(&raw, FAULT_RAW_LIMIT))
        }
    }
}

/// Body of `GET /api/agent`.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct AgentHealthResponse {
    pub status: String,
    pub message: String,
    pub lyzr_api_key_configured: bool,
    pub environment: String,
    pub timestamp: String,
}

/// Agent endpoint health
///
/// Reports whether the upstream API key is configured. Never fails with a
/// non-JSON body.
#[utoipa::path(
    get,
    path = "/api/agent",
    responses(
        (status = 200, description = "Endpoint is running", body = AgentHealthResponse),
        (status = 500, description = "Health report could not be produced")
    ),
    tag = "agent"
)]
pub async fn agent_health(State(state): State<AppState>) -> Response {
    let report = AgentHealthResponse {
        status: "ok".to_string(),
        message: "Agent proxy API is running".to_string(),
        lyzr_api_key_configured: state.config.api_key_configured(),
        environment: state.config.environment.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };

    match containment::render(StatusCode::OK, &report) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "Failed to render health report");
            containment::health_fallback_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::AppConfig;
    use crate::upstream::{InferenceTransport, TransportError};

    enum Scripted {
        Reply(u16, String),
        Timeout,
        Panic,
    }

    struct FakeTransport {
        script: Scripted,
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl FakeTransport {
        fn new(script: Scripted) -> Arc<Self> {
            Arc::new(Self {
                script,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn replying(status: u16, body: &str) -> Arc<Self> {
            Self::new(Scripted::Reply(status, body.to_string()))
        }

        fn sent(&self) -> Vec<(String, Value)> {
            self.sent.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl InferenceTransport for FakeTransport {
        async fn send(
            &self,
            api_key: &str,
            payload: &Value,
        ) -> Result<UpstreamReply, TransportError> {
            self.sent
                .lock()
                .expect("lock")
                .push((api_key.to_string(), payload.clone()));
            match &self.script {
                Scripted::Reply(status, body) => Ok(UpstreamReply {
                    status: *status,
                    body: body.clone(),
                }),
                Scripted::Timeout => Err(TransportError::Timeout(Duration::from_secs(1))),
                Scripted::Panic => panic!("transport exploded"),
            }
        }
    }

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
    }

    fn app(config: AppConfig, transport: Arc<FakeTransport>) -> Router {
        router(None).with_state(AppState::new(config, transport))
    }

    fn configured_app(transport: Arc<FakeTransport>) -> Router {
        app(config(&[("LYZR_API_KEY", "sk-test")]), transport)
    }

    async fn post_raw(app: Router, body: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(AGENT_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        let status = response.status();
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .expect("content-type header should exist"),
            "application/json"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let json = serde_json::from_slice(&bytes).expect("body should be json");
        (status, json)
    }

    async fn post(app: Router, body: Value) -> (StatusCode, Value) {
        post_raw(app, &body.to_string()).await
    }

    fn chat(message: &str) -> Value {
        json!({"message": message, "agent_id": "strategist"})
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let transport = FakeTransport::replying(200, "{}");
        let (status, body) = post_raw(configured_app(transport.clone()), "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["status"], "error");
        assert_eq!(body["response"]["message"], "Invalid JSON in request body");
        assert_eq!(body["error"], "Invalid JSON in request body");
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_with_an_envelope() {
        let transport = FakeTransport::replying(200, "{}");
        let body = chat(&"x".repeat(3 * 1024 * 1024)).to_string();
        assert!(body.len() > AGENT_BODY_LIMIT);

        let (status, body) = post_raw(configured_app(transport.clone()), &body).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["status"], "error");
        assert_eq!(body["response"]["message"], messages::BODY_TOO_LARGE);
        assert_eq!(body["error"], messages::BODY_TOO_LARGE);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_agent_id_is_rejected() {
        let transport = FakeTransport::replying(200, "{}");
        let (status, body) = post(
            configured_app(transport.clone()),
            json!({"message": "pick my team"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["message"], "message and agent_id are required");
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn empty_message_counts_as_missing() {
        let (status, _) = post(
            configured_app(FakeTransport::replying(200, "{}")),
            json!({"message": "", "agent_id": "a"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_secret_is_a_configuration_error() {
        let transport = FakeTransport::replying(200, "{}");
        let (status, body) = post(app(config(&[]), transport.clone()), chat("hi")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["message"], "LYZR_API_KEY not configured");
        assert_eq!(body["error"], "LYZR_API_KEY not configured on server");
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn happy_path_normalizes_and_echoes_identities() {
        let raw = r#"{"response": {"message": "Pick Norris"}}"#;
        let transport = FakeTransport::replying(200, raw);
        let (status, body) = post(configured_app(transport.clone()), chat("who?")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(
            body["response"],
            json!({"status": "success", "result": {"text": "Pick Norris"}, "message": "Pick Norris"})
        );
        assert_eq!(body["agent_id"], "strategist");
        assert_eq!(body["raw_response"], raw);
        assert!(body["timestamp"].as_str().expect("timestamp").ends_with('Z'));

        let user_id = body["user_id"].as_str().expect("user_id");
        let session_id = body["session_id"].as_str().expect("session_id");
        assert!(user_id.starts_with("user-"));
        assert!(session_id.starts_with("strategist-"));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (api_key, payload) = &sent[0];
        assert_eq!(api_key, "sk-test");
        assert_eq!(
            payload,
            &json!({
                "message": "who?",
                "agent_id": "strategist",
                "user_id": user_id,
                "session_id": session_id,
            })
        );
    }

    #[tokio::test]
    async fn caller_identities_and_assets_are_forwarded() {
        let transport = FakeTransport::replying(200, r#""ok""#);
        let (status, body) = post(
            configured_app(transport.clone()),
            json!({
                "message": "analyse",
                "agent_id": "a1",
                "user_id": "u1",
                "session_id": "s1",
                "assets": ["asset-1"]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_id"], "u1");
        assert_eq!(body["session_id"], "s1");
        assert_eq!(transport.sent()[0].1["assets"], json!(["asset-1"]));
    }

    #[tokio::test]
    async fn empty_assets_are_not_forwarded() {
        let transport = FakeTransport::replying(200, r#""ok""#);
        post(
            configured_app(transport.clone()),
            json!({"message": "m", "agent_id": "a", "assets": []}),
        )
        .await;
        assert!(transport.sent()[0].1.get("assets").is_none());
    }

    #[tokio::test]
    async fn undecodable_reply_is_truncated_to_1000_chars() {
        let raw = "x".repeat(2500);
        let transport = FakeTransport::replying(200, &raw);
        let (status, body) = post(configured_app(transport), chat("hi")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["status"], "error");
        assert!(
            body["error"]
                .as_str()
                .expect("error")
                .starts_with("Failed to parse JSON")
        );
        let echoed = body["raw_response"].as_str().expect("raw_response");
        assert_eq!(echoed.chars().count(), 1000);
    }

    #[tokio::test]
    async fn agent_reported_failure_uses_its_error() {
        let transport =
            FakeTransport::replying(200, r#"{"success": false, "error": "agent crashed"}"#);
        let (status, body) = post(configured_app(transport), chat("hi")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["message"], "agent crashed");
    }

    #[tokio::test]
    async fn null_reply_is_a_parse_failure() {
        let (status, body) =
            post(configured_app(FakeTransport::replying(200, "null")), chat("hi")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["message"], messages::PARSE_FAILED);
    }

    #[tokio::test]
    async fn falsy_replies_are_parse_failures() {
        for raw in [r#""""#, "0", "false"] {
            let (status, body) =
                post(configured_app(FakeTransport::replying(200, raw)), chat("hi")).await;
            assert_eq!(status, StatusCode::OK, "reply {raw}");
            assert_eq!(body["success"], false, "reply {raw}");
            assert_eq!(body["response"]["status"], "error");
            assert_eq!(body["response"]["message"], messages::PARSE_FAILED);
            assert_eq!(body["raw_response"], raw);
        }
    }

    #[tokio::test]
    async fn nested_falsy_reply_is_an_empty_response() {
        let raw = r#"{"response": false}"#;
        let (status, body) =
            post(configured_app(FakeTransport::replying(200, raw)), chat("hi")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(
            body["response"],
            json!({"status": "error", "result": {}, "message": "Empty response from agent"})
        );
    }

    #[tokio::test]
    async fn upstream_error_status_is_echoed() {
        let raw = r#"{"detail": "Invalid API key"}"#;
        let (status, body) =
            post(configured_app(FakeTransport::replying(401, raw)), chat("hi")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["message"], "Invalid API key");
        assert_eq!(body["raw_response"], raw);
    }

    #[tokio::test]
    async fn upstream_error_without_message_uses_generic_text() {
        let (status, body) = post(
            configured_app(FakeTransport::replying(503, "<html>bad gateway</html>")),
            chat("hi"),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "API returned status 503");
        assert_eq!(body["raw_response"], "<html>bad gateway</html>");
    }

    #[tokio::test]
    async fn transport_failure_is_contained() {
        let (status, body) = post(
            configured_app(FakeTransport::new(Scripted::Timeout)),
            chat("hi"),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["response"]["status"], "error");
        assert_eq!(body["error"], "Upstream request timed out after 1 seconds");
        assert!(body.get("stack").is_none());
    }

    #[tokio::test]
    async fn panics_become_500_envelopes() {
        let (status, body) = post(
            configured_app(FakeTransport::new(Scripted::Panic)),
            chat("hi"),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "transport exploded");
        assert!(body.get("stack").is_none());
    }

    #[tokio::test]
    async fn development_exposes_fault_trace() {
        let app = app(
            config(&[("LYZR_API_KEY", "k"), ("PITLANE_ENV", "development")]),
            FakeTransport::new(Scripted::Panic),
        );
        let (_, body) = post(app, chat("hi")).await;
        assert_eq!(body["stack"], "panicked: transport exploded");
    }

    #[test]
    fn decoder_panic_is_contained_with_short_prefix() {
        let raw = "y".repeat(900);
        let outcome = reply_outcome(&raw, |_| panic!("decoder bug"));
        let request = InferenceRequest {
            message: "m".to_string(),
            agent_id: "a".to_string(),
            user_id: None,
            session_id: None,
            assets: Vec::new(),
        };
        let identity = Identity::resolve("a", None, None);
        let envelope = outcome_envelope(outcome, &request, &identity, raw);

        assert!(!envelope.success);
        assert!(envelope.response.is_error());
        assert_eq!(
            envelope.response.message.as_deref(),
            Some("JSON parsing error: decoder bug")
        );
        assert_eq!(envelope.error.as_deref(), Some("JSON parsing failed"));
        assert_eq!(envelope.details.as_deref(), Some("decoder bug"));
        assert_eq!(
            envelope.raw_response.expect("raw_response").chars().count(),
            500
        );
    }

    #[test]
    fn upstream_error_message_prefers_error_field() {
        assert_eq!(
            upstream_error_message(r#"{"error": "quota", "message": "m"}"#),
            Some("quota".to_string())
        );
        assert_eq!(
            upstream_error_message(r#"{"error": {"message": "nested"}}"#),
            Some("nested".to_string())
        );
        assert_eq!(
            upstream_error_message(r#"{"message": "only message"}"#),
            Some("only message".to_string())
        );
        assert_eq!(upstream_error_message("plain text"), None);
        assert_eq!(upstream_error_message(r#"["list"]"#), None);
    }

    #[test]
    fn request_ignores_optional_fields_of_wrong_type() {
        let request = InferenceRequest::from_body(&json!({
            "message": "m",
            "agent_id": "a",
            "user_id": 7,
            "assets": "not-a-list"
        }))
        .expect("valid request");
        assert_eq!(request.user_id, None);
        assert!(request.assets.is_empty());
    }

    #[test]
    fn non_object_body_is_missing_fields() {
        assert!(matches!(
            InferenceRequest::from_body(&json!(["message", "agent_id"])),
            Err(AppError::MissingFields)
        ));
    }

    fn limited_app(transport: Arc<FakeTransport>) -> Router {
        router(Some(crate::middleware::rate_limit::agent_layer()))
            .with_state(AppState::new(config(&[("LYZR_API_KEY", "sk-test")]), transport))
    }

    fn from_client(request: axum::http::request::Builder) -> axum::http::request::Builder {
        request.header("x-forwarded-for", "203.0.113.7")
    }

    #[tokio::test]
    async fn rate_limit_applies_to_post_only() {
        let app = limited_app(FakeTransport::replying(200, r#""ok""#));

        for _ in 0..15 {
            let response = app
                .clone()
                .oneshot(
                    from_client(Request::builder().uri(AGENT_PATH))
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("request should succeed");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let mut last = StatusCode::OK;
        for _ in 0..15 {
            let response = app
                .clone()
                .oneshot(
                    from_client(Request::builder().method("POST").uri(AGENT_PATH))
                        .header("content-type", "application/json")
                        .body(Body::from(chat("hi").to_string()))
                        .expect("request should build"),
                )
                .await
                .expect("request should succeed");
            last = response.status();
        }
        assert_eq!(last, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn health_reports_key_configuration() {
        let app = app(
            config(&[("PITLANE_ENV", "production")]),
            FakeTransport::replying(200, "{}"),
        );
        let response = app
            .oneshot(
                Request::builder()
                    .uri(AGENT_PATH)
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let body: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["status"], "ok");
        assert_eq!(body["lyzr_api_key_configured"], false);
        assert_eq!(body["environment"], "production");
    }
}
