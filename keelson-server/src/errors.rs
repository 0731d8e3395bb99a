use std::fmt;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keelson_core::{ClusterError, StoreError};

use crate::api::ApiResponse;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::<()>::error(self.message));
        (self.status, body).into_response()
    }
}

impl From<ClusterError> for AppError {
    fn from(err: ClusterError) -> Self {
        let message = err.to_string();
        match err {
            ClusterError::Validation(_) => Self::bad_request(message),
            ClusterError::ClusterNotFound(_)
            | ClusterError::NodeNotFound { .. }
            | ClusterError::Store(StoreError::NotFound { .. }) => {
                Self::not_found(message)
            }
            ClusterError::AlreadyPrimary(_)
            | ClusterError::AlreadyRunning(_)
            | ClusterError::NoPrimary(_)
            | ClusterError::InvalidState { .. }
            | ClusterError::Busy(_)
            | ClusterError::Store(StoreError::Conflict(_)) => Self::conflict(message),
            ClusterError::ReadinessTimeout { .. } => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, message)
            }
            other => {
                tracing::error!(error = %other, "cluster operation failed");
                Self::internal(message)
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keelson_model::{ClusterId, InfrastructureStatus, NodeId};

    use super::*;

    #[test]
    fn cluster_errors_map_to_http_statuses() {
        let id = ClusterId::new();
        let cases = [
            (ClusterError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (ClusterError::ClusterNotFound(id), StatusCode::NOT_FOUND),
            (
                ClusterError::NodeNotFound {
                    cluster: id,
                    node: NodeId::new(),
                },
                StatusCode::NOT_FOUND,
            ),
            (ClusterError::Busy(id), StatusCode::CONFLICT),
            (
                ClusterError::InvalidState {
                    cluster: id,
                    status: InfrastructureStatus::Stopped,
                    operation: "scale",
                },
                StatusCode::CONFLICT,
            ),
            (
                ClusterError::ReadinessTimeout {
                    node: "pg-0".into(),
                    waited: Duration::from_secs(60),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ClusterError::Cancelled("shutdown".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(AppError::from(error).status, expected);
        }
    }
}
