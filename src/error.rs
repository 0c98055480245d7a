use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unsupported Chat Mode, {0}!")]
    UnsupportedMode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend failure: {0}")]
    BackendFailure(String),

    #[error("Client transport closed")]
    TransportClosed,
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::UnsupportedMode(_) => "E0001",
            DispatchError::InvalidRequest(_) => "E0002",
            DispatchError::NotFound(_) => "E0003",
            DispatchError::BackendFailure(_) => "E0004",
            DispatchError::TransportClosed => "E0005",
        }
    }

    /// Errors raised while routing, before the first frame is written.
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            DispatchError::UnsupportedMode(_)
                | DispatchError::InvalidRequest(_)
                | DispatchError::NotFound(_)
        )
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        DispatchError::BackendFailure(e.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        DispatchError::BackendFailure(e.to_string())
    }
}

/// The structured failure body returned instead of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FailureResult {
    pub success: bool,
    pub err_code: String,
    pub err_msg: String,
}

impl FailureResult {
    pub fn from_error(err: &DispatchError) -> Self {
        FailureResult {
            success: false,
            err_code: err.code().to_string(),
            err_msg: err.to_string(),
        }
    }
}

impl ResponseError for DispatchError {
    fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::UnsupportedMode(_) | DispatchError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::BackendFailure(_) => StatusCode::BAD_GATEWAY,
            DispatchError::TransportClosed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.is_routing_error() {
            log::warn!("Rejected chat request: {}", self)
        } else {
            log::error!("Chat request failed before streaming: {}", self)
        }
        HttpResponse::build(self.status_code()).json(FailureResult::from_error(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_result() {
        let err = DispatchError::NotFound("domain graph for tag finance".to_string());
        let failure = FailureResult::from_error(&err);
        assert!(!failure.success);
        assert_eq!(failure.err_code, "E0003");
        assert_eq!(failure.err_msg, "Not found: domain graph for tag finance");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(err.is_routing_error());
        assert!(!DispatchError::TransportClosed.is_routing_error());
    }
}
