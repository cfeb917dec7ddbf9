use std::time::Duration;

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::models::ScanStatus;

pub type LabResult<T> = Result<T, LabError>;

#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("cannot move scan from {from} to {to}")]
    InvalidStateTransition { from: ScanStatus, to: ScanStatus },

    #[error("{tool} failed: {detail}")]
    ToolExecution { tool: String, detail: String },

    #[error("{tool} timed out after {}", human_duration(*after))]
    Timeout { tool: String, after: Duration },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LabError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn scan_not_found(id: i64) -> Self {
        Self::NotFound(format!("scan {id}"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound(_) => "NotFound",
            Self::InvalidStateTransition { .. } => "InvalidStateTransition",
            Self::ToolExecution { .. } => "ToolExecutionFailure",
            Self::Timeout { .. } => "Timeout",
            Self::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Self::Database(_) => "DatabaseError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            Self::ToolExecution { .. } | Self::Timeout { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Whole seconds print as `5s`, anything finer as milliseconds.
fn human_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

impl From<JsonRejection> for LabError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for LabError {
    fn from(rejection: PathRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for LabError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl IntoResponse for LabError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // sqlx messages can leak schema details
        let message = match &self {
            Self::Database(e) => {
                error!(error = %e, "database operation failed");
                "database operation failed".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": message,
                "status": status.as_u16(),
            }
        }));
        (status, body).into_response()
    }
}
