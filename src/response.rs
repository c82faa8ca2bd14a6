use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Success envelope: `{success, data, message, timestamp}`.
pub fn success(data: impl Serialize, message: &str) -> Response {
    Json(json!({
        "success": true,
        "data": data,
        "message": message,
        "timestamp": now_epoch_secs(),
    }))
    .into_response()
}

/// Success envelope plus a public cache-control header. Analytics reads are
/// idempotent and the store only changes via bulk import, so brief caching is
/// always safe.
pub fn success_cached(data: impl Serialize, message: &str, max_age_secs: u32) -> Response {
    let mut resp = success(data, message);
    if let Ok(v) = header::HeaderValue::from_str(&format!("public, max-age={max_age_secs}")) {
        resp.headers_mut().insert(header::CACHE_CONTROL, v);
    }
    resp
}

/// Error half of the envelope: `{success: false, error: {message,
/// statusCode}, timestamp}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Store/transport failure: the cause is logged server-side, the caller
    /// only sees a generic message.
    pub fn internal(err: anyhow::Error) -> Self {
        tracing::error!("internal error: {err:#}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error".to_string(),
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[cfg(test)]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": {
                "message": self.message,
                "statusCode": self.status.as_u16(),
            },
            "timestamp": now_epoch_secs(),
        }));
        (self.status, body).into_response()
    }
}
