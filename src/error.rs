//! Error codes and plain-text error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Seconds a client is told to wait before retrying a not-yet-ready backend
pub const RETRY_AFTER_SECS: u64 = 5;

/// Error codes for routing failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Host header present but malformed
    InvalidHost,
    /// No service is bound to the host
    UnknownHost,
    /// The chosen version does not exist on the service
    VersionNotFound,
    /// The service has no usable traffic split
    NoActiveVersion,
    /// Container started but did not pass its readiness probe in time
    BackendNotReady,
    /// Container runtime refused to create or start the container
    BackendStartFailed,
    /// No host port left to bind a container to
    PortsExhausted,
    /// Gateway is shutting down
    ShuttingDown,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidHost => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::VersionNotFound => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::NoActiveVersion => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::PortsExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::InvalidHost => "INVALID_HOST",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::VersionNotFound => "VERSION_NOT_FOUND",
            ProxyErrorCode::NoActiveVersion => "NO_ACTIVE_VERSION",
            ProxyErrorCode::BackendNotReady => "BACKEND_NOT_READY",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::PortsExhausted => "PORTS_EXHAUSTED",
            ProxyErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Retry-After hint in seconds, for errors expected to clear on their own
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProxyErrorCode::BackendNotReady => Some(RETRY_AFTER_SECS),
            _ => None,
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut body = message.into();
    body.push('\n');

    let mut builder = Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value());
    if let Some(secs) = code.retry_after() {
        builder = builder.header("Retry-After", secs);
    }

    builder
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
