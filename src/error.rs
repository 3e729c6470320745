use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("Connect to {target} refused: {source}")]
    ConnectRefused {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Relay I/O error: {0}")]
    RelayIo(std::io::Error),

    #[error("Origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("Connection is already part of a tunnel")]
    AlreadyPaired,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hyper error: {0}")]
    Hyper(String),
}

impl ProxyError {
    /// Status line sent to the client when this error ends an exchange.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::ConnectTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ConnectRefused { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::OriginUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::Hyper(e.to_string())
    }
}
