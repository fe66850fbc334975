use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::identity::Identity;

/// Outcome flag of a normalized agent reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

impl EnvelopeStatus {
    /// Upstream status strings collapse to `Error` only on an exact `"error"`.
    pub fn from_upstream(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(s)) if s == "error" => Self::Error,
            _ => Self::Success,
        }
    }
}

/// Canonical shape every agent reply is normalized into.
///
/// `result` is always an object; `{}` stands for "no structured payload".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NormalizedEnvelope {
    pub status: EnvelopeStatus,
    #[schema(value_type = Object)]
    pub result: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Map<String, Value>>,
}

impl NormalizedEnvelope {
    pub fn success(result: Map<String, Value>) -> Self {
        Self {
            status: EnvelopeStatus::Success,
            result,
            message: None,
            metadata: None,
        }
    }

    /// Error envelope with an empty result and the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Error,
            result: Map::new(),
            message: Some(message.into()),
            metadata: None,
        }
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<Map<String, Value>>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == EnvelopeStatus::Error
    }
}

/// Body of every response the proxy sends for `POST /api/agent`.
///
/// Build failures through [`ResponseEnvelope::failure`] so that
/// `success == false` always travels with `response.status == "error"`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResponseEnvelope {
    pub success: bool,
    pub response: NormalizedEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// RFC 3339 generation time, present on the success path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Upstream body for diagnostics; truncated on ambiguous failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Fault trace, only emitted in development.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ResponseEnvelope {
    /// Failure envelope whose `response.message` and `error` share one text.
    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            response: NormalizedEnvelope::error(message.clone()),
            agent_id: None,
            user_id: None,
            session_id: None,
            timestamp: None,
            raw_response: None,
            error: Some(message),
            details: None,
            stack: None,
        }
    }

    /// Successful round trip: normalized reply plus the identities used.
    pub fn completed(
        response: NormalizedEnvelope,
        agent_id: &str,
        identity: &Identity,
        timestamp: String,
        raw_response: String,
    ) -> Self {
        Self {
            success: true,
            response,
            agent_id: Some(agent_id.to_string()),
            user_id: Some(identity.user_id.clone()),
            session_id: Some(identity.session_id.clone()),
            timestamp: Some(timestamp),
            raw_response: Some(raw_response),
            error: None,
            details: None,
            stack: None,
        }
    }

    /// Replace the `error` field while keeping `response.message`.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }
}

/// First `limit` characters of `raw`, never splitting a code point.
pub fn truncate_chars(raw: &str, limit: usize) -> String {
    match raw.char_indices().nth(limit) {
        Some((idx, _)) => raw[..idx].to_string(),
        None => raw.to_string(),
    }
}
