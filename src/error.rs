//! Error taxonomy for receipt ingestion and confirmation
//!
//! Every public operation fails with exactly one of these kinds. Callers
//! switch on the variant; nothing here is compared by message.

use thiserror::Error;

use crate::recognition::RecognitionError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed upload or missing file, caller-side, nothing written
    #[error("Invalid input: {0}")]
    Input(String),

    /// Recognition call could not complete (network, quota, auth)
    #[error("Recognition service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Recognition succeeded but produced no text
    #[error("No text detected in the image")]
    NoTextDetected,

    /// Business rule violated, staging record unchanged
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown bill or staged item
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence failure, any transactional unit was rolled back
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Caller aborted or the deadline passed
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Retryable failures map to "try again", the rest reject the request
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable(_) => true,
            // a lost race or duplicate key fails the same way every time
            Error::Store(StoreError::Conflict(_)) => false,
            Error::Store(_) => true,
            _ => false,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Error::NotFound(what),
            StoreError::Interrupted => Error::Cancelled,
            other => Error::Store(other),
        }
    }
}

impl From<RecognitionError> for Error {
    fn from(err: RecognitionError) -> Self {
        match err {
            RecognitionError::ServiceUnavailable(reason) => Error::ServiceUnavailable(reason),
            RecognitionError::NoTextDetected => Error::NoTextDetected,
            RecognitionError::Cancelled => Error::Cancelled,
        }
    }
}

/// Convenience Result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_keep_their_kind() {
        let err: Error = StoreError::NotFound("bill abc".to_string()).into();
        assert!(matches!(err, Error::NotFound(_)));

        let err: Error = StoreError::Interrupted.into();
        assert!(matches!(err, Error::Cancelled));

        let err: Error = StoreError::Conflict("already confirmed".to_string()).into();
        assert!(matches!(err, Error::Store(StoreError::Conflict(_))));
        assert!(!err.is_retryable());

        let err: Error = StoreError::Corrupt("connection mutex poisoned".to_string()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_recognition_errors_map_one_to_one() {
        let err: Error = RecognitionError::NoTextDetected.into();
        assert!(matches!(err, Error::NoTextDetected));
        assert!(!err.is_retryable());

        let err: Error = RecognitionError::ServiceUnavailable("quota".to_string()).into();
        assert!(err.is_retryable());
    }
}
