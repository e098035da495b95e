use thiserror::Error;

#[derive(Error, Debug)]
pub enum PinakesError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XRPC call failed with an HTTP status. `ratelimit_reset` carries the
    /// `ratelimit-reset` header (epoch seconds) when the server sent one.
    #[error("XRPC error {status}: {message}")]
    Xrpc {
        status: u16,
        message: String,
        ratelimit_reset: Option<u64>,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("DID not found: {0}")]
    DidNotFound(String),

    #[error("Invalid DID document for {0}: {1}")]
    InvalidDidDocument(String, String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Malformed repository: {0}")]
    MalformedRepo(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Embedding generation error: {0}")]
    EmbeddingError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl PinakesError {
    /// Whether this error is a cancellation-style failure (timeout/abort).
    /// The task queue re-appends these instead of dropping the task; the RPC
    /// retry ladder propagates them untouched for the same reason.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Reqwest(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Xrpc { status, .. } => Some(*status),
            Self::Reqwest(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<&str> for PinakesError {
    fn from(msg: &str) -> Self {
        Self::Custom(msg.to_string())
    }
}

impl From<String> for PinakesError {
    fn from(msg: String) -> Self {
        Self::Custom(msg)
    }
}

impl From<tokio::time::error::Elapsed> for PinakesError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PinakesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_cancellation() {
        assert!(PinakesError::Timeout("thread view".into()).is_cancellation());
    }

    #[test]
    fn xrpc_error_is_not_cancellation() {
        let err = PinakesError::Xrpc {
            status: 500,
            message: "internal".into(),
            ratelimit_reset: None,
        };
        assert!(!err.is_cancellation());
        assert_eq!(err.status(), Some(500));
    }
}
