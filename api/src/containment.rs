//! Last line of defense for the HTTP boundary.
//!
//! Two independent ways of producing a response body:
//!
//! - [`render`] serializes a typed body with `serde_json` and builds the
//!   response through `http::Response::builder`. Every normal response goes
//!   through it and it reports its own failures as [`RenderError`].
//! - [`last_resort_response`] / [`health_fallback_response`] return fixed,
//!   hand-written JSON bytes and touch nothing on the `render` path.
//!
//! [`fault_response`] turns an escalated fault into a 500 envelope using the
//! first and drops to the second when the first fails.

use std::any::Any;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use pitlane_core::envelope::ResponseEnvelope;
use pitlane_core::error::messages;
use serde::Serialize;

use crate::error::AppError;

const LAST_RESORT_BODY: &str = r#"{"success":false,"response":{"status":"error","result":{},"message":"Catastrophic server error"},"error":"Catastrophic server error"}"#;

const HEALTH_FALLBACK_BODY: &str =
    r#"{"status":"error","message":"Failed to generate health check response"}"#;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to serialize response body: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to build response: {0}")]
    Http(#[from] axum::http::Error),
}

/// Something that escaped the handler: an escalated error or a panic.
#[derive(Debug)]
pub enum Fault {
    Error(AppError),
    Panic(String),
}

impl Fault {
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Fault::Panic(panic_message(payload.as_ref()))
    }

    pub fn message(&self) -> String {
        match self {
            Fault::Error(err) => err.to_string(),
            Fault::Panic(message) => message.clone(),
        }
    }

    pub fn trace(&self) -> String {
        match self {
            Fault::Error(err) => err.trace(),
            Fault::Panic(message) => format!("panicked: {message}"),
        }
    }
}

impl From<AppError> for Fault {
    fn from(err: AppError) -> Self {
        Fault::Error(err)
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        messages::SERVER_ERROR.to_string()
    }
}

/// JSON response with an explicit content type.
pub fn render<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Result<Response, RenderError> {
    let bytes = serde_json::to_vec(body)?;
    let response = axum::http::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))?;
    Ok(response)
}

/// [`render`], degrading to [`last_resort_response`] on failure.
pub fn respond<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Response {
    match render(status, body) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, status = status.as_u16(), "Falling back to last-resort response");
            last_resort_response()
        }
    }
}

/// 500 envelope for a fault. The trace is attached only when `expose_trace`.
pub fn fault_response(fault: Fault, expose_trace: bool) -> Response {
    tracing::error!(
        event = "agent_request_fault",
        error = %fault.message(),
        "Unexpected error in agent handler"
    );
    let envelope =
        ResponseEnvelope::failure(fault.message()).with_stack(expose_trace.then(|| fault.trace()));
    respond(StatusCode::INTERNAL_SERVER_ERROR, &envelope)
}

/// Fixed failure envelope; shares no code with [`render`].
pub fn last_resort_response() -> Response {
    fixed_json_response(LAST_RESORT_BODY)
}

/// Minimal health payload used when the health report cannot be rendered.
pub fn health_fallback_response() -> Response {
    fixed_json_response(HEALTH_FALLBACK_BODY)
}

fn fixed_json_response(body: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde::Serializer;
    use serde_json::{Value, json};

    use super::*;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refusing to serialize"))
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        serde_json::from_slice(&bytes).expect("body should be json")
    }

    #[test]
    fn last_resort_body_is_a_valid_failure_envelope() {
        let body: ResponseEnvelope =
            serde_json::from_str(LAST_RESORT_BODY).expect("fixed body must stay valid");
        assert!(!body.success);
        assert!(body.response.is_error());
        assert_eq!(body.response.message.as_deref(), Some(messages::CATASTROPHIC));
    }

    #[test]
    fn health_fallback_body_is_valid_json() {
        let body: Value = serde_json::from_str(HEALTH_FALLBACK_BODY).expect("valid json");
        assert_eq!(body["status"], "error");
    }

    #[test]
    fn render_reports_serialization_failures() {
        let err = render(StatusCode::OK, &Unserializable).expect_err("must fail");
        assert!(matches!(err, RenderError::Serialize(_)));
    }

    #[tokio::test]
    async fn respond_degrades_to_last_resort() {
        let response = respond(StatusCode::OK, &Unserializable);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response
                .headers()
                .get(CONTENT_TYPE)
                .expect("content-type header should exist"),
            "application/json"
        );
        assert_eq!(body_json(response).await["error"], messages::CATASTROPHIC);
    }

    #[tokio::test]
    async fn fault_response_hides_trace_unless_exposed() {
        let hidden = fault_response(Fault::Panic("boom".to_string()), false);
        assert_eq!(hidden.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(hidden).await;
        assert_eq!(
            body,
            json!({
                "success": false,
                "response": {"status": "error", "result": {}, "message": "boom"},
                "error": "boom",
            })
        );

        let exposed = body_json(fault_response(Fault::Panic("boom".to_string()), true)).await;
        assert_eq!(exposed["stack"], "panicked: boom");
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "Server error");
    }
}
