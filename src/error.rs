use crate::priority::Priority;
use thiserror::Error;

/// Errors raised while configuring, persisting or driving a limiter.
#[derive(Debug, Error)]
pub enum PacerError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<validator::ValidationErrors> for PacerError {
    fn from(err: validator::ValidationErrors) -> Self {
        PacerError::ValidationError(err.to_string())
    }
}

pub type PacerResult<T> = Result<T, PacerError>;

/// Outcome of a rate-limited call that did not produce a value.
///
/// `Rejected` means the operation was never started; `Operation` carries the
/// operation's own error untouched so callers can pick a retry policy.
#[derive(Debug, Error)]
pub enum LimitError<E> {
    #[error("Rate limit exceeded: {endpoint} did not admit a {priority} request")]
    Rejected { endpoint: String, priority: Priority },

    #[error("Operation failed: {0}")]
    Operation(E),

    #[error(transparent)]
    Limiter(PacerError),
}

impl<E> LimitError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LimitError::Rejected { .. })
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            LimitError::Operation(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_distinguishable() {
        let rejected: LimitError<std::io::Error> = LimitError::Rejected {
            endpoint: "search".to_string(),
            priority: Priority::Low,
        };
        assert!(rejected.is_rate_limited());
        assert_eq!(
            rejected.to_string(),
            "Rate limit exceeded: search did not admit a LOW request"
        );

        let failed: LimitError<String> = LimitError::Operation("boom".to_string());
        assert!(!failed.is_rate_limited());
        assert_eq!(failed.into_operation_error().as_deref(), Some("boom"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: PacerError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, PacerError::Io(_)));
    }
}
