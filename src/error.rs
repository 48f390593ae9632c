//! Bridge worker error types

use thiserror::Error;

/// Bridge worker error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad or missing key, unreadable config file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backend rejected the bridge key or session token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Transient network failure talking to the backend
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Command could not be executed
    #[error("Execution error: {0}")]
    Execution(String),

    /// Supervised process failure
    #[error("Supervision error: {0}")]
    Supervision(String),

    /// Malformed backend payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config file parse error
    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Config file write error
    #[error("Config write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Authorization and configuration failures are not transient: they
    /// need an operator to fix the key, although the bridge keeps retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connectivity(_) | Error::Http(_) | Error::Io(_))
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;
