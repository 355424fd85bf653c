//! Request-level errors.
//!
//! Every failure that escapes [`crate::Destination::on_event`] or the HTTP
//! layer is a [`DestinationError`]. Each variant belongs to one kind:
//!
//! ```text
//! Kind           | Variants                                  | Status
//! ---------------|-------------------------------------------|-------------------
//! Configuration  | DestinationNotFound, UnknownAction,       | 404 / 400
//!                | InvalidSubscription                       |
//! Parse          | Filter, SubscriptionJson, InvalidHeader,  | 400 / 422
//!                | InvalidBody                               |
//! Validation     | Validation, Action (validate step)        | 400
//! Upstream       | Action                                    | upstream or 500
//! Credential     | InvalidCredentials                        | 401
//! ```

use crate::action::{ActionError, StepError};
use crate::filter::ParseError;
use crate::schema::ValidationError;
use crate::settings::SubscriptionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Parse,
    Validation,
    Upstream,
    Credential,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Upstream => "UpstreamError",
            ErrorKind::Credential => "CredentialError",
        }
    }
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination '{0}' not found")]
    DestinationNotFound(String),

    #[error("\"{0}\" is not a valid action")]
    UnknownAction(String),

    #[error("invalid subscription at index {index}: {reason}")]
    InvalidSubscription { index: usize, reason: String },

    #[error("invalid subscription filter: {0}")]
    Filter(#[from] ParseError),

    #[error("subscriptions are not valid JSON: {0}")]
    SubscriptionJson(serde_json::Error),

    #[error("Invalid header \"{header}\": {reason}")]
    InvalidHeader { header: String, reason: String },

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("action \"{action}\" failed: {source}")]
    Action { action: String, source: ActionError },

    #[error("Credentials are invalid")]
    InvalidCredentials,
}

impl DestinationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DestinationError::DestinationNotFound(_)
            | DestinationError::UnknownAction(_)
            | DestinationError::InvalidSubscription { .. } => ErrorKind::Configuration,
            DestinationError::Filter(_)
            | DestinationError::SubscriptionJson(_)
            | DestinationError::InvalidHeader { .. }
            | DestinationError::InvalidBody(_) => ErrorKind::Parse,
            DestinationError::Validation(_) => ErrorKind::Validation,
            DestinationError::Action { source, .. } => match &source.source {
                StepError::Validation(_) => ErrorKind::Validation,
                _ => ErrorKind::Upstream,
            },
            DestinationError::InvalidCredentials => ErrorKind::Credential,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DestinationError::DestinationNotFound(_) => StatusCode::NOT_FOUND,
            DestinationError::UnknownAction(_)
            | DestinationError::InvalidSubscription { .. }
            | DestinationError::Filter(_)
            | DestinationError::SubscriptionJson(_)
            | DestinationError::InvalidBody(_)
            | DestinationError::Validation(_) => StatusCode::BAD_REQUEST,
            DestinationError::InvalidHeader { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DestinationError::Action { source, .. } => match &source.source {
                StepError::Validation(_) => StatusCode::BAD_REQUEST,
                other => other
                    .upstream_status()
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            },
            DestinationError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<SubscriptionError> for DestinationError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Json(e) => DestinationError::SubscriptionJson(e),
            SubscriptionError::Invalid { index, reason } => {
                DestinationError::InvalidSubscription { index, reason }
            }
        }
    }
}

impl IntoResponse for DestinationError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "status": status.as_u16(),
            "name": self.name(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn action_error(source: StepError) -> DestinationError {
        DestinationError::Action {
            action: "createUpdatePerson".into(),
            source: ActionError {
                step: "request",
                source,
            },
        }
    }

    #[test]
    fn test_configuration_errors() {
        let err = DestinationError::UnknownAction("nope".into());
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "\"nope\" is not a valid action");

        let err = DestinationError::DestinationNotFound("x".into());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.name(), "ConfigurationError");
    }

    #[test]
    fn test_upstream_status_passes_through() {
        let err = action_error(StepError::Http {
            status: 429,
            method: "POST".into(),
            url: "https://api.example/persons".into(),
            body: Value::Null,
        });
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let err = action_error(StepError::Failed("boom".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_validation_inside_action() {
        let err = action_error(StepError::Validation(ValidationError {
            subject: "payload".into(),
            violations: vec!["\"id\" is a required property".into()],
        }));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_header_error_is_unprocessable() {
        let err = DestinationError::InvalidHeader {
            header: "settings".into(),
            reason: "expected value".into(),
        };
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(err.to_string().contains("\"settings\""));
    }
}
