use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

// ─── Core error taxonomy ────────────────────────────────────────────────────

/// Typed errors returned by the core subsystems (transmuxer, SFU, chat).
///
/// Each variant is a *kind*, not a concrete failure: callers match on the
/// variant to decide policy (reject, isolate, log-and-continue) and read the
/// message for diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    /// Stream / room / user / segment / peer does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stream key, publisher, or room user already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Empty required field, out-of-range value, malformed SDP or payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Room closed, stream not active, invalid state transition.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Rate-limit deny, subscriber cap reached, queue full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Moderation action forbidden for the caller's role.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Best-effort I/O failed; callers log and continue.
    #[error("transient: {0}")]
    Transient(String),

    /// Unrecoverable initialization failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Stable machine-readable code for wire envelopes and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Unauthorized(_) => "unauthorized",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
        }
    }

    /// HTTP status a public API call carrying this kind maps to.
    fn http_status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) | Self::PreconditionFailed(_) => StatusCode::CONFLICT,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ─── ApiError ───────────────────────────────────────────────────────────────

/// HTTP-facing error: a status plus the machine-readable code and message
/// that become the JSON body.
///
/// ```json
/// {
///   "error": {
///     "code": "stream_not_found",
///     "message": "Stream 'abc123' does not exist.",
///     "status": 404
///   }
/// }
/// ```
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// Server faults get an error-level record, client mistakes a warning.
    /// Nothing below 400 reaches this type, so there is no quiet branch.
    fn emit_log(&self) {
        let status = self.status.as_u16();
        if status >= 500 {
            tracing::error!(code = self.code, status, "{}", self.message);
        } else {
            tracing::warn!(code = self.code, status, "{}", self.message);
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.emit_log();
        let body = serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "status": self.status.as_u16(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::new(err.http_status(), err.code(), err.to_string())
    }
}

// ─── Constructors ───────────────────────────────────────────────────────────

impl ApiError {
    /// 404 Not Found with a custom message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    /// 400 Bad Request with a custom message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    /// 500 Internal Server Error with a custom message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error", msg)
    }

    /// 404 — the requested stream does not exist.
    pub fn stream_not_found(stream_key: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "stream_not_found",
            format!("Stream '{stream_key}' does not exist."),
        )
    }

    /// 404 — the requested chat room does not exist.
    pub fn room_not_found(room_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "room_not_found",
            format!("Room '{room_id}' does not exist."),
        )
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    /// Helper: convert an `ApiError` into its JSON body string.
    async fn body_string(err: ApiError) -> String {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let json = body_string(ApiError::stream_not_found("abc123")).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"]["code"], "stream_not_found");
        assert_eq!(value["error"]["message"], "Stream 'abc123' does not exist.");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn core_error_maps_to_status() {
        let api: ApiError = Error::already_exists("stream 's'").into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.code, "already_exists");

        let api: ApiError = Error::exhausted("rate limited").into();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);

        let api: ApiError = Error::unauthorized("viewer cannot ban").into();
        assert_eq!(api.status, StatusCode::FORBIDDEN);

        let api: ApiError = Error::precondition("room closed").into();
        assert_eq!(api.status, StatusCode::CONFLICT);
    }

    #[test]
    fn error_display_includes_kind() {
        let e = Error::not_found("stream 'x'");
        assert_eq!(e.to_string(), "not found: stream 'x'");
        assert_eq!(e.code(), "not_found");
    }

    #[tokio::test]
    async fn internal_error_500() {
        let response = ApiError::internal("broken").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_string(ApiError::internal("broken")).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"]["status"], 500);
    }
}
