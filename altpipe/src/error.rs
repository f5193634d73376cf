//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Media too large: {size} bytes exceeds the {limit} byte ceiling")]
    TooLarge { size: u64, limit: u64 },

    #[error("Encoder engine failed to load: {0}")]
    EngineLoad(String),

    #[error("Transcode produced no output file: {0}")]
    OutputMissing(String),

    #[error("Chunking produced no usable chunks: {0}")]
    NoChunksProduced(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

impl From<encoder_engine::EngineError> for Error {
    fn from(e: encoder_engine::EngineError) -> Self {
        use encoder_engine::EngineError;
        match e {
            EngineError::Load(msg) => Self::EngineLoad(msg),
            EngineError::OutputMissing(name) => Self::OutputMissing(name),
            EngineError::Io(e) => Self::Io(e),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Fetch(e.to_string())
    }
}
