//! Error taxonomy and plain-text error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors surfaced while routing a single request
///
/// Every variant carries owned strings so one start outcome can be shared by
/// all requests that waited on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// No app directory exists for the requested host
    #[error("Unconfigured host")]
    UnconfiguredHost,

    /// The app directory exists but the backend could not be brought up
    #[error("Failed to start: {0}")]
    StartFailure(String),

    /// Talking to a started backend failed
    #[error("Error with {target}: {message}")]
    Transport { target: String, message: String },

    /// Anything else that went wrong while handling the request
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RouterError {
    pub fn start_failure(message: impl Into<String>) -> Self {
        RouterError::StartFailure(message.into())
    }

    pub fn transport(target: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RouterError::Transport {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn code(&self) -> ProxyErrorCode {
        match self {
            RouterError::UnconfiguredHost => ProxyErrorCode::UnconfiguredHost,
            RouterError::StartFailure(_) => ProxyErrorCode::StartFailed,
            RouterError::Transport { .. } => ProxyErrorCode::TransportFailed,
            RouterError::Unknown(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// Errors from registry bookkeeping
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("An app is already registered for {0}")]
    AlreadyRegistered(String),
}

/// Errors from a single proxied exchange with a backend
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("Failed to read request body: {0}")]
    Body(#[from] hyper::Error),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Error codes attached to router-generated responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No app directory for the host
    UnconfiguredHost,
    /// Backend failed to start or never became ready
    StartFailed,
    /// Connect/read/write failure against a started backend
    TransportFailed,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Internal router error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnconfiguredHost => StatusCode::NOT_IMPLEMENTED,
            ProxyErrorCode::StartFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::TransportFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnconfiguredHost => "UNCONFIGURED_HOST",
            ProxyErrorCode::StartFailed => "START_FAILED",
            ProxyErrorCode::TransportFailed => "TRANSPORT_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Create a plain-text error response of the form `"<host>: <message>"`
pub fn text_error_response(
    code: ProxyErrorCode,
    host: &str,
    message: impl std::fmt::Display,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!("{}: {}", host, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Turn a routing error into the response sent to the client
pub fn router_error_response(host: &str, error: &RouterError) -> Response<BoxBody<Bytes, hyper::Error>> {
    text_error_response(error.code(), host, error)
}
