use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Errors that can occur while proxying a request
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    ClientMalformed(String),

    #[error("No configuration for destination {0}")]
    ConfigMissing(String),

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("unable to process response; content-type is {0}")]
    UnprocessableUpstreamBody(String),

    #[error("Filter error: {0}")]
    FilterError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}
