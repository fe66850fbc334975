use std::error::Error as _;

use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pitlane_core::envelope::ResponseEnvelope;
use pitlane_core::error::{self, messages};

use crate::containment::{self, RenderError};
use crate::upstream::TransportError;

/// Failures raised while handling `POST /api/agent`.
///
/// Client and configuration errors answer directly through `IntoResponse`.
/// Faults (`is_fault`) are escalated to the handler's outer containment,
/// which owns the 500 envelope and the development-only trace.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Body could not be buffered, usually because it exceeds the limit (413)
    #[error("{}", unreadable_body_message(.0))]
    UnreadableBody(#[source] BytesRejection),
    /// Body is not JSON (400)
    #[error("{}", messages::INVALID_BODY)]
    InvalidBody(#[source] serde_json::Error),
    /// `message` or `agent_id` missing (400)
    #[error("{}", messages::MISSING_FIELDS)]
    MissingFields,
    /// Shared secret not configured (500)
    #[error("{}", error::not_configured_message())]
    NotConfigured,
    /// Network-level failure talking to the inference service (500)
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Response body could not be produced (500)
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::UnreadableBody(rejection) => rejection.status(),
            AppError::InvalidBody(_) | AppError::MissingFields => StatusCode::BAD_REQUEST,
            AppError::NotConfigured | AppError::Transport(_) | AppError::Render(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Unexpected failures that belong to the top-level containment.
    pub fn is_fault(&self) -> bool {
        matches!(self, AppError::Transport(_) | AppError::Render(_))
    }

    pub fn envelope(&self) -> ResponseEnvelope {
        let envelope = ResponseEnvelope::failure(self.to_string());
        match self {
            AppError::NotConfigured => envelope.with_error(error::not_configured_error()),
            _ => envelope,
        }
    }

    /// The error and each of its sources, one per line.
    pub fn trace(&self) -> String {
        let mut lines = vec![format!("{self}")];
        let mut source = self.source();
        while let Some(err) = source {
            lines.push(format!("caused by: {err}"));
            source = err.source();
        }
        lines.join("\n")
    }
}

fn unreadable_body_message(rejection: &BytesRejection) -> &'static str {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        messages::BODY_TOO_LARGE
    } else {
        messages::INVALID_BODY
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self.status_code() {
            status if status.is_client_error() => {
                tracing::info!(error = %self, status = status.as_u16(), "Rejected agent request");
            }
            status => {
                tracing::error!(error = %self, status = status.as_u16(), "Agent request failed");
            }
        }
        containment::respond(self.status_code(), &self.envelope())
    }
}
