//! Error types for slotbook operations.

use thiserror::Error;

/// Errors that can occur while orchestrating bookings.
#[derive(Error, Debug)]
pub enum BookingError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not allowed: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cancellation did not complete, payment could not be refunded: {0}")]
    RefundFailed(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider '{0}' not found in PATH")]
    ProviderNotInstalled(String),

    #[error("Provider request timed out after {0}s")]
    ProviderTimeout(u64),

    #[error("Recurrence error: {0}")]
    Recurrence(String),

    #[error("Datastore error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an error should be surfaced to whoever made the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any side effect happened.
    Validation,
    Unauthorized,
    NotFound,
    Conflict,
    /// An upstream collaborator failed in a way the request cannot absorb.
    BadGateway,
    Internal,
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::Validation(_) | BookingError::Recurrence(_) => ErrorKind::Validation,
            BookingError::Unauthorized(_) => ErrorKind::Unauthorized,
            BookingError::NotFound(_) => ErrorKind::NotFound,
            BookingError::Conflict(_) => ErrorKind::Conflict,
            BookingError::RefundFailed(_)
            | BookingError::Provider(_)
            | BookingError::ProviderNotInstalled(_)
            | BookingError::ProviderTimeout(_) => ErrorKind::BadGateway,
            BookingError::Store(_)
            | BookingError::Config(_)
            | BookingError::Serialization(_)
            | BookingError::Io(_) => ErrorKind::Internal,
        }
    }
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        BookingError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for BookingError {
    fn from(err: serde_json::Error) -> Self {
        BookingError::Serialization(err.to_string())
    }
}

/// Result type alias for slotbook operations.
pub type BookingResult<T> = Result<T, BookingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refund_failure_reads_as_incomplete_cancellation() {
        let err = BookingError::RefundFailed("card_declined".into());
        assert_eq!(err.kind(), ErrorKind::BadGateway);
        assert!(
            err.to_string()
                .starts_with("Cancellation did not complete, payment could not be refunded"),
            "Unexpected message: {}",
            err
        );
    }

    #[test]
    fn test_recurrence_errors_are_validation_errors() {
        let err = BookingError::Recurrence("interval must be 1 or 2 weeks".into());
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
