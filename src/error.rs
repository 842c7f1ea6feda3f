//! Error types and handling for bandpoints

use thiserror::Error;

/// Result type alias for bandpoints operations
pub type Result<T> = std::result::Result<T, Error>;

/// bandpoints error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Daily cap reached for account {account}: cap {cap}")]
    DailyCapReached { account: String, cap: i64 },

    #[error("Conversion disabled")]
    ConversionDisabled,

    #[error("Insufficient points: have {have}, want {want}")]
    InsufficientPoints { have: i64, want: i64 },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a caller may safely retry the failed operation with the
    /// same inputs (the ledger writer is idempotent per dedupe key).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Sqlite(_) | Error::Io(_) | Error::Network(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Validation(format!("Invalid hex: {}", err))
    }
}
