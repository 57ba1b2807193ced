use thiserror::Error;

use crate::types::HorizonKey;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    #[error("Registry conflict on {key}: expected revision {expected}, found {actual}")]
    RegistryConflict {
        key: HorizonKey,
        expected: u64,
        actual: u64,
    },

    #[error("Unknown horizon: {0}")]
    UnknownHorizon(HorizonKey),

    #[error("Forbidden transition on {key}: {reason}")]
    ForbiddenTransition { key: HorizonKey, reason: String },

    #[error("Invalid configuration: {field}: {reason}")]
    ConfigurationInvalid { field: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::ConfigurationInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Conflicts are the only errors an evaluator should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::RegistryConflict { .. })
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
