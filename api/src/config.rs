use std::time::Duration;

use pitlane_core::error::API_KEY_ENV;

pub const DEFAULT_UPSTREAM_URL: &str = "https://agent-prod.studio.lyzr.ai/v3/inference/chat/";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000";

/// Process-wide settings, read once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Shared secret sent upstream as `x-api-key`. `None` when unset or blank;
    /// requests then fail with a configuration error instead of the process
    /// refusing to start.
    pub api_key: Option<String>,
    pub upstream_url: String,
    pub upstream_timeout: Duration,
    /// Free-form deployment label, `"unknown"` when unset.
    pub environment: String,
    pub port: u16,
    /// Comma-separated browser origins allowed by CORS.
    pub cors_origins: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests never touch the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let upstream_timeout = read("PITLANE_UPSTREAM_TIMEOUT_SECS")
            .and_then(|secs| secs.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);

        Self {
            api_key: read(API_KEY_ENV),
            upstream_url: read("PITLANE_UPSTREAM_URL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            upstream_timeout: Duration::from_secs(upstream_timeout),
            environment: read("PITLANE_ENV")
                .or_else(|| read("NODE_ENV"))
                .unwrap_or_else(|| "unknown".to_string()),
            port: read("PORT")
                .and_then(|port| port.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            cors_origins: read("PITLANE_CORS_ORIGINS")
                .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string()),
        }
    }

    pub fn api_key_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Fault traces are only attached to error responses in development.
    pub fn exposes_fault_traces(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }
}
