//! Caller-facing failure texts.
//!
//! These strings are part of the HTTP contract: clients match on them, so they
//! live in one place instead of being spelled out at each call site.

/// Messages placed in `response.message` / `error` of failure envelopes.
pub mod messages {
    pub const EMPTY_RESPONSE: &str = "Empty response from agent";
    pub const INVALID_BODY: &str = "Invalid JSON in request body";
    pub const BODY_TOO_LARGE: &str = "Request body too large";
    pub const MISSING_FIELDS: &str = "message and agent_id are required";
    pub const PARSE_FAILED: &str =
        "Failed to parse agent response. The agent may have returned invalid JSON.";
    pub const PARSE_FAULT: &str = "JSON parsing failed";
    pub const CATASTROPHIC: &str = "Catastrophic server error";
    pub const SERVER_ERROR: &str = "Server error";
}

/// Name of the shared secret the proxy authenticates upstream with.
pub const API_KEY_ENV: &str = "LYZR_API_KEY";

/// `"<SECRET> not configured"`, used as the envelope message.
pub fn not_configured_message() -> String {
    format!("{API_KEY_ENV} not configured")
}

/// Longer variant of [`not_configured_message`] used for the `error` field.
pub fn not_configured_error() -> String {
    format!("{API_KEY_ENV} not configured on server")
}

/// Fallback message when a non-OK upstream body carries no usable text.
pub fn upstream_status_message(status: u16) -> String {
    format!("API returned status {status}")
}
