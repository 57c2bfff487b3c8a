use std::time::Duration;

use application::{ApplicationError, HubError};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use domain::DomainError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// 429 响应体
#[derive(Debug, Serialize)]
pub struct RateLimitBody {
    pub error: &'static str,
    pub details: String,
    pub retry_after_seconds: u64,
    pub retry_after: String,
}

#[derive(Debug)]
enum Body {
    Error(ErrorBody),
    RateLimited(RateLimitBody),
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Body,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Body::Error(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: Body::RateLimited(RateLimitBody {
                error: "rate_limited",
                details: format!(
                    "too many requests, retry after {}",
                    format_retry_after(retry_after)
                ),
                retry_after_seconds: retry_after_seconds(retry_after),
                retry_after: format_retry_after(retry_after),
            }),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// 向上取整到秒
pub fn retry_after_seconds(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// 人类可读的等待时长，例如 `4m59s`、`1h0m5s`
pub fn format_retry_after(retry_after: Duration) -> String {
    let total = retry_after_seconds(retry_after);
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::InvalidArgument { field, reason } => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                format!("{}: {}", field, reason),
            ),
            DomainError::MalformedFrame { reason } => {
                ApiError::new(StatusCode::BAD_REQUEST, "MALFORMED_FRAME", reason)
            }
            DomainError::PermissionDenied { action } => ApiError::new(
                StatusCode::FORBIDDEN,
                "PERMISSION_DENIED",
                format!("not allowed to {}", action),
            ),
        }
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use application::ApplicationError as AppErr;

        match error {
            AppErr::Domain(err) => err.into(),
            AppErr::RateLimited { retry_after } => ApiError::rate_limited(retry_after),
            AppErr::Hub(HubError::TooManyConnections { max, .. }) => ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "TOO_MANY_CONNECTIONS",
                format!("at most {} concurrent connections allowed", max),
            ),
            AppErr::Hub(err @ HubError::DuplicateConnection(_)) => {
                ApiError::new(StatusCode::CONFLICT, "DUPLICATE_CONNECTION", err.to_string())
            }
            AppErr::Hub(err) => {
                tracing::error!(error = %err, "hub error");
                ApiError::internal_server_error(err.to_string())
            }
            AppErr::NotRoomMember(room_id) => ApiError::new(
                StatusCode::FORBIDDEN,
                "NOT_ROOM_MEMBER",
                format!("not a member of room {}", room_id),
            ),
            AppErr::Authorization => ApiError::new(
                StatusCode::FORBIDDEN,
                "AUTHORIZATION_FAILED",
                "authorization failed",
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.body {
            Body::Error(body) => (self.status, Json(body)).into_response(),
            Body::RateLimited(body) => {
                let mut response = (self.status, Json(&body)).into_response();
                if let Ok(value) = HeaderValue::from_str(&body.retry_after_seconds.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
        }
    }
}
