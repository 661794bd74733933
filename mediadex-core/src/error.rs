use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediadexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("frame/PTS pairing timeout: {0}")]
    Desync(String),

    #[error("decode truncated: expected {expected:.2}s, observed {observed:.2}s")]
    Truncated { expected: f64, observed: f64 },

    #[error("poisoned: {0}")]
    Poison(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MediadexError {
    /// Whether the current asset attempt may be retried by another claim.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MediadexError::Transient(_)
                | MediadexError::Desync(_)
                | MediadexError::Truncated { .. }
                | MediadexError::Io(_)
        )
    }

    /// Configuration errors abort the whole worker process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MediadexError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, MediadexError>;
