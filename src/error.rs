//! Error taxonomy and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors surfaced by the registry, supervisor, router and model dispatch
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown or removed application id
    #[error("application not found: {0}")]
    NotFound(String),

    /// The process could not be spawned or its port could not be bound
    #[error("failed to launch application: {0}")]
    LaunchFailure(String),

    /// The allocated port was taken before the backend could use it
    #[error("port {0} is no longer available")]
    PortUnavailable(u16),

    /// Backend crashed, stopped, or refused the connection
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend has not finished starting
    #[error("backend is still starting")]
    BackendStarting,

    /// Backend did not answer within the request timeout
    #[error("backend did not respond within {} seconds", .0.as_secs())]
    BackendTimeout(Duration),

    /// The third-party inference call failed
    #[error("Inference failed: {0}")]
    UpstreamFailure(String),

    /// Unknown model id in a dispatch request
    #[error("Model not found")]
    UnknownModel(String),

    /// Caller credential does not match the model table
    #[error("Invalid API key")]
    InvalidCredential,

    /// Malformed submission or request body
    #[error("invalid request: {0}")]
    InvalidSubmission(String),

    /// Request body over the configured limit
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl Error {
    /// The client-facing error code for this error
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            Error::NotFound(_) => ProxyErrorCode::UnknownApp,
            Error::LaunchFailure(_) | Error::PortUnavailable(_) => ProxyErrorCode::LaunchFailed,
            Error::BackendUnavailable(_) => ProxyErrorCode::BackendUnavailable,
            Error::BackendStarting => ProxyErrorCode::BackendStarting,
            Error::BackendTimeout(_) => ProxyErrorCode::RequestTimeout,
            Error::UpstreamFailure(_) => ProxyErrorCode::UpstreamFailed,
            Error::UnknownModel(_) => ProxyErrorCode::ModelNotFound,
            Error::InvalidCredential => ProxyErrorCode::InvalidApiKey,
            Error::InvalidSubmission(_) => ProxyErrorCode::InvalidRequest,
            Error::PayloadTooLarge(_) => ProxyErrorCode::PayloadTooLarge,
        }
    }

    /// Render as a JSON error response
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error codes for client-facing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No application with this id
    UnknownApp,
    /// No route for this path
    NotFound,
    /// Submission could not be launched
    LaunchFailed,
    /// Backend crashed, stopped or unreachable
    BackendUnavailable,
    /// Backend still starting after the startup timeout
    BackendStarting,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Malformed request
    InvalidRequest,
    /// Request body too large
    PayloadTooLarge,
    /// Unknown model id
    ModelNotFound,
    /// Wrong API key for the model
    InvalidApiKey,
    /// Inference provider call failed
    UpstreamFailed,
    /// Internal error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::LaunchFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BackendStarting => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::ModelNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::UpstreamFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownApp => "UNKNOWN_APP",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::LaunchFailed => "LAUNCH_FAILED",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::BackendStarting => "BACKEND_STARTING",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ProxyErrorCode::InvalidApiKey => "INVALID_API_KEY",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
