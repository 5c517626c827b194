//! Error type shared by the storage backends.

use thiserror::Error;

use crate::step::StepError;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl StoreError {
    /// Connectivity-style failures that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            StepError::Retryable(err.into())
        } else {
            StepError::Permanent(err.into())
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
