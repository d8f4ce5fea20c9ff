//! Failure taxonomy shared by the queue consumers and file handlers.
//!
//! Terminal variants describe inputs that will never succeed and must not be
//! redelivered; the remaining variants are transient and escalate to queue
//! redelivery once handler-level retries are exhausted.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessingError {
    /// User-visible rejection of the input itself (bad filename, unsupported
    /// extension, bulk job without a ZIP). Terminal.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Password protected or encrypted input. Terminal.
    #[error("file is password protected")]
    FileProtected,
    /// Corrupt archive or unreadable document. Terminal.
    #[error("malformed content: {0}")]
    MalformedContent(String),
    /// I/O failure that may succeed on retry.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    /// External tool or service failure that may succeed on retry.
    #[error("external failure: {0}")]
    TransientExternal(String),
    #[error("database error: {0}")]
    Database(String),
}

impl ProcessingError {
    /// Terminal failures are recorded on the owning row and acknowledged;
    /// everything else forces redelivery.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingError::Validation(_)
                | ProcessingError::FileProtected
                | ProcessingError::MalformedContent(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }
}

impl From<std::io::Error> for ProcessingError {
    fn from(err: std::io::Error) -> Self {
        ProcessingError::TransientIo(err.to_string())
    }
}

impl From<tokio_postgres::Error> for ProcessingError {
    fn from(err: tokio_postgres::Error) -> Self {
        ProcessingError::Database(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for ProcessingError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        ProcessingError::Database(err.to_string())
    }
}

/// Convenience alias for results that use [`ProcessingError`].
pub type Result<T> = std::result::Result<T, ProcessingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(ProcessingError::Validation("x".into()).is_terminal());
        assert!(ProcessingError::FileProtected.is_terminal());
        assert!(ProcessingError::MalformedContent("x".into()).is_terminal());
        assert!(ProcessingError::TransientIo("x".into()).is_retryable());
        assert!(ProcessingError::TransientExternal("x".into()).is_retryable());
        assert!(ProcessingError::Database("x".into()).is_retryable());
    }
}
