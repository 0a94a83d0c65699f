use thiserror::Error;

/// Application-wide error types for Quarry.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (page or asset download).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request or bounded wait timed out.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// The browser session misbehaved (protocol error, crashed tab).
    #[error("Browser error: {0}")]
    BrowserError(String),

    /// A live element went away between lookup and read.
    #[error("Stale element: {0}")]
    StaleElement(String),

    /// The page never produced a usable snapshot.
    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    /// A CSS selector could not be parsed.
    #[error("Invalid selector '{0}'")]
    SelectorError(String),

    /// Downloaded bytes failed a format, size or dedup check.
    #[error("Image rejected: {0}")]
    ImageRejected(String),

    /// Download exceeded the configured byte ceiling.
    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The task was cancelled from outside.
    #[error("Task cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::StaleElement(_)
            | AppError::BrowserError(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::StaleElement("#landingImage".into()).is_retryable());
        assert!(AppError::HttpError("connection reset by peer".into()).is_retryable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!AppError::ImageRejected("not an image".into()).is_retryable());
        assert!(!AppError::PayloadTooLarge { limit: 10 }.is_retryable());
        assert!(!AppError::SelectorError("##".into()).is_retryable());
        assert!(!AppError::HttpError("HTTP 404 for https://x".into()).is_retryable());
        assert!(!AppError::Cancelled.is_retryable());
    }
}
