//! HTTP error rendering
//!
//! Every error leaves the server as JSON `{error, details?}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::executor::ExecutionError;
use crate::planner::PlannerError;
use crate::validator::ValidationReport;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid plan")]
    InvalidPlan(ValidationReport),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("planner is not configured")]
    PlannerUnavailable,

    #[error("planner failed: {0}")]
    Planner(String),

    #[error("planner produced an invalid plan")]
    PlannerOutputInvalid(ValidationReport),

    #[error("timed out: {0}")]
    Timeout(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPlan(_) | Self::BadRequest(_) | Self::Execution(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::PlannerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Planner(_) | Self::PlannerOutputInvalid(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::InvalidPlan(report) | Self::PlannerOutputInvalid(report) => {
                Some(Value::from(report.errors.clone()))
            }
            _ => None,
        }
    }
}

impl From<PlannerError> for ApiError {
    fn from(err: PlannerError) -> Self {
        match err {
            PlannerError::NotConfigured => Self::PlannerUnavailable,
            other => Self::Planner(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
