use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, Response, StatusCode};
use pitlane_core::envelope::ResponseEnvelope;
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
};

use crate::containment;

pub type RateLimitLayer =
    GovernorLayer<SmartIpKeyExtractor, governor::middleware::NoOpMiddleware, axum::body::Body>;

/// Rate limit for /api/agent: 20 requests per minute per IP, bursts of 10.
///
/// Each request costs one upstream inference call.
pub fn agent_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(3) // one token every 3s = 20 per minute
            .burst_size(10)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for agent"),
    )
    .error_handler(envelope_error_handler)
}

/// Answer limiter rejections with the same failure envelope as the handler.
fn envelope_error_handler(err: GovernorError) -> Response<axum::body::Body> {
    let (status, retry_after, message) = rejection_parts(err);

    let mut response = containment::respond(status, &ResponseEnvelope::failure(message));
    if let Some(wait_time) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&wait_time.to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}

fn rejection_parts(err: GovernorError) -> (StatusCode, Option<u64>, String) {
    match err {
        GovernorError::TooManyRequests { wait_time, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            Some(wait_time),
            format!("Too many requests. Retry after {wait_time} seconds."),
        ),
        GovernorError::UnableToExtractKey => (
            StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "Unable to determine client identity for rate limiting".to_string(),
        ),
        GovernorError::Other { code, msg, .. } => {
            (code, None, msg.unwrap_or_else(|| "Request rejected".to_string()))
        }
    }
}
