//! HTTP错误响应

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use pacs_core::PacsError;
use serde_json::json;
use tracing::{error, warn};

/// 接口错误，包装统一错误类型并映射到HTTP状态码
#[derive(Debug)]
pub struct ApiError(pub PacsError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(PacsError::Validation(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PacsError::NotFound(_) => StatusCode::NOT_FOUND,
            PacsError::AmbiguousMatch(_) | PacsError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            PacsError::Validation(_) | PacsError::Serialization(_) => StatusCode::BAD_REQUEST,
            PacsError::Collaborator(_) => StatusCode::BAD_GATEWAY,
            PacsError::Bus(_) | PacsError::Storage(_) | PacsError::Database(_) | PacsError::Network(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PacsError::OrphanedExamination { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PacsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PacsError::Config(_) | PacsError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PacsError> for ApiError {
    fn from(err: PacsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.0.kind(), "Request failed: {}", self.0);
        } else {
            warn!(kind = self.0.kind(), "Request rejected: {}", self.0);
        }

        let mut body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        // 已保存的检查仍可按ID查询
        if let PacsError::OrphanedExamination { request_id, .. } = &self.0 {
            body["requestId"] = json!(request_id);
        }

        (status, Json(body)).into_response()
    }
}
