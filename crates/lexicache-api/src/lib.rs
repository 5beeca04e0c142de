use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use lexicache_core::CacheError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error body returned by every cache endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    /// Always `"error"`.
    pub status: String,
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// High-level API errors to be mapped to HTTP responses
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::ServiceUnavailable(_) => "unavailable",
            ApiError::GatewayTimeout(_) => "timeout",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::ServiceUnavailable(msg)
            | ApiError::GatewayTimeout(msg)
            | ApiError::Internal(msg) => msg.clone(),
        };
        ErrorBody::new(self.code(), message)
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            CacheError::NotFound(msg) => ApiError::NotFound(msg),
            CacheError::Conflict(msg) => ApiError::Conflict(msg),
            CacheError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            CacheError::Timeout { operation, .. } => {
                ApiError::GatewayTimeout(format!("cache operation '{operation}' timed out"))
            }
            CacheError::PartialFailure { succeeded, failed } => ApiError::Internal(format!(
                "operation partially failed ({succeeded} succeeded, {failed} failed)"
            )),
            // Backend and configuration details stay in the logs.
            other => ApiError::Internal(format!("internal cache error ({})", other.category())),
        }
    }
}

fn json_content_type() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

fn fallback_response() -> Response {
    let mut resp = Response::new(axum::body::Body::from("{}"));
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp.headers_mut().insert(header::CONTENT_TYPE, json_content_type());
    resp
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match serde_json::to_vec(&self.to_body()) {
            Ok(b) => b,
            Err(_) => {
                // Fallback minimal body if serialization fails
                serde_json::to_vec(&ErrorBody::new("internal", "Serialization failure"))
                    .unwrap_or_else(|_| b"{}".to_vec())
            }
        };

        axum::http::Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, json_content_type())
            .body(axum::body::Body::from(body))
            .unwrap_or_else(|_| fallback_response())
    }
}

/// JSON response with an explicit status and optional extra headers.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub value: T,
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl<T> ApiResponse<T> {
    pub fn new(value: T, status: StatusCode) -> Self {
        Self {
            value,
            status,
            headers: Vec::new(),
        }
    }

    pub fn ok(value: T) -> Self {
        Self::new(value, StatusCode::OK)
    }

    pub fn accepted(value: T) -> Self {
        Self::new(value, StatusCode::ACCEPTED)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = match serde_json::to_vec(&self.value) {
            Ok(b) => b,
            Err(_) => return ApiError::internal("Serialization failure").into_response(),
        };
        let mut builder = axum::http::Response::builder()
            .status(self.status)
            .header(header::CONTENT_TYPE, json_content_type());
        for (n, v) in self.headers.into_iter() {
            builder = builder.header(n, v);
        }
        builder
            .body(axum::body::Body::from(body))
            .unwrap_or_else(|_| fallback_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn into_response_sets_status_and_content_type() {
        let resp = ApiError::bad_request("unknown view").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let content_type = resp.headers().get(header::CONTENT_TYPE).unwrap();
        assert_eq!(content_type, &HeaderValue::from_static("application/json"));
    }

    #[test]
    fn error_body_shape() {
        let body = ApiError::not_found("job 42").to_body();
        assert_eq!(body.status, "error");
        assert_eq!(body.code, "not_found");
        assert_eq!(body.message, "job 42");
    }

    #[test]
    fn cache_errors_map_to_status() {
        let cases: Vec<(CacheError, StatusCode)> = vec![
            (CacheError::invalid_request("x"), StatusCode::BAD_REQUEST),
            (CacheError::not_found("x"), StatusCode::NOT_FOUND),
            (CacheError::conflict("x"), StatusCode::CONFLICT),
            (CacheError::unavailable("x"), StatusCode::SERVICE_UNAVAILABLE),
            (
                CacheError::timeout("set", Duration::from_secs(2)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                CacheError::backend("node-a", "ECONNREFUSED"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases.into_iter() {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn backend_details_are_not_exposed() {
        let api: ApiError = CacheError::backend("redis-eu-1", "AUTH failed for user admin").into();
        let body = api.to_body();
        assert!(!body.message.contains("admin"));
        assert!(!body.message.contains("redis-eu-1"));
        assert_eq!(body.code, "internal");
    }

    #[test]
    fn api_response_can_add_headers() {
        let resp = ApiResponse::accepted(serde_json::json!({"jobId": "abc"}))
            .with_header(header::LOCATION, HeaderValue::from_static("/cache/warming"))
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            &HeaderValue::from_static("/cache/warming")
        );
    }
}
