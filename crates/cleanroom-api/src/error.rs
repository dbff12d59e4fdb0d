//! API error handling.
//!
//! Every failure is answered with a `{code, msg}` envelope; clients branch on
//! `code`, the HTTP status mirrors it.

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Response codes of the job surface.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const INTERNAL: i32 = 10001;
    pub const LIMIT_EXCEEDED: i32 = 10002;
    pub const NOT_FOUND: i32 = 10003;
    pub const INVALID_INPUT: i32 = 10004;
    pub const UNAUTHORIZED: i32 = 10005;
}

const LIMIT_MESSAGE: &str = "The number of in progress jobs has reached the limit";

/// API error type.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: codes::INVALID_INPUT,
            msg: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: codes::UNAUTHORIZED,
            msg: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "msg": self.msg,
        }));

        (self.status, body).into_response()
    }
}

impl From<cleanroom_core::Error> for ApiError {
    fn from(err: cleanroom_core::Error) -> Self {
        use cleanroom_core::Error;

        match err {
            Error::NotFound(msg) => ApiError {
                status: StatusCode::NOT_FOUND,
                code: codes::NOT_FOUND,
                msg: format!("not found: {}", msg),
            },
            Error::InvalidInput(_) | Error::InvalidTransition { .. } => {
                ApiError::bad_request(err.to_string())
            }
            Error::LimitExceeded(_) => ApiError {
                status: StatusCode::TOO_MANY_REQUESTS,
                code: codes::LIMIT_EXCEEDED,
                msg: LIMIT_MESSAGE.to_string(),
            },
            Error::Unauthorized(msg) => ApiError::unauthorized(msg),
            Error::Upstream { .. } | Error::Internal(_) => {
                tracing::error!(error = %err, "Request failed");
                ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: codes::INTERNAL,
                    msg: format!("Service internal error: {}", err),
                }
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError {
            status: err.status(),
            code: codes::INVALID_INPUT,
            msg: err.body_text(),
        }
    }
}
