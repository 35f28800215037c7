use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

use crate::storage::StorageError;

/// The unified error type for the churn pipeline
#[derive(Error, Debug)]
pub enum ChurnError {
    #[error("[E{code:04}] Validation error: {message}", code = ErrorCode::VALIDATION_GENERIC)]
    Validation { message: String },

    #[error("[E{code:04}] Invalid test fraction {0}: must be within [0, 1)", code = ErrorCode::VALIDATION_INVALID_FRACTION)]
    InvalidFraction(f64),

    #[error("[E{code:04}] Temporal split requires rows sorted by date (row {row} is out of order)", code = ErrorCode::VALIDATION_UNSORTED_INPUT)]
    UnsortedInput { row: usize },

    #[error("[E{code:04}] Invalid status transition: {from} -> {to}", code = ErrorCode::VALIDATION_INVALID_TRANSITION)]
    InvalidTransition { from: String, to: String },

    #[error("[E{code:04}] {message}", code = ErrorCode::NOT_FOUND_GENERIC)]
    NotFound { message: String },

    #[error("[E{code:04}] No trained model found for organization {org_id}. Please train a model first.", code = ErrorCode::NOT_FOUND_ARTIFACT)]
    ArtifactNotFound { org_id: String },

    #[error("[E{code:04}] Insufficient data for training. Need at least {required} samples, got {actual}", code = ErrorCode::TRAINING_INSUFFICIENT_DATA)]
    InsufficientData { required: usize, actual: usize },

    #[error("[E{code:04}] Unsupported algorithm '{0}'. Must be one of: logistic_regression, random_forest, gradient_boosting", code = ErrorCode::TRAINING_UNSUPPORTED_ALGORITHM)]
    UnsupportedAlgorithm(String),

    #[error("[E{code:04}] Storage unavailable: {0}", code = ErrorCode::STORAGE_UNAVAILABLE)]
    StorageUnavailable(String),

    #[error("[E{code:04}] Stage failed: {0}", code = ErrorCode::STAGE_INTERNAL)]
    InternalStage(String),
}

impl ChurnError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a missing record, e.g. `"Dataset 42"`
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound {
            message: format!("{what} not found"),
        }
    }

    /// Create an internal stage error
    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::InternalStage(message.to_string())
    }

    /// Get the numeric error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Validation { .. } => ErrorCode::VALIDATION_GENERIC,
            Self::InvalidFraction(_) => ErrorCode::VALIDATION_INVALID_FRACTION,
            Self::UnsortedInput { .. } => ErrorCode::VALIDATION_UNSORTED_INPUT,
            Self::InvalidTransition { .. } => ErrorCode::VALIDATION_INVALID_TRANSITION,
            Self::NotFound { .. } => ErrorCode::NOT_FOUND_GENERIC,
            Self::ArtifactNotFound { .. } => ErrorCode::NOT_FOUND_ARTIFACT,
            Self::InsufficientData { .. } => ErrorCode::TRAINING_INSUFFICIENT_DATA,
            Self::UnsupportedAlgorithm(_) => ErrorCode::TRAINING_UNSUPPORTED_ALGORITHM,
            Self::StorageUnavailable(_) => ErrorCode::STORAGE_UNAVAILABLE,
            Self::InternalStage(_) => ErrorCode::STAGE_INTERNAL,
        }
    }

    /// Check if this error is transient and worth retrying at the boundary
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Check if this is any kind of not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ArtifactNotFound { .. })
    }
}

impl From<StorageError> for ChurnError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => Self::not_found(what),
            StorageError::Serialization(msg) => Self::InternalStage(msg),
            StorageError::Configuration(msg) => Self::Validation { message: msg },
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<csv::Error> for ChurnError {
    fn from(err: csv::Error) -> Self {
        Self::validation(format!("malformed CSV: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_match_variants() {
        assert_eq!(
            ChurnError::validation("empty events").code(),
            ErrorCode::VALIDATION_GENERIC
        );
        assert_eq!(
            ChurnError::InsufficientData {
                required: 10,
                actual: 9
            }
            .code(),
            ErrorCode::TRAINING_INSUFFICIENT_DATA
        );
        assert_eq!(
            ChurnError::UnsupportedAlgorithm("svm".into()).code(),
            ErrorCode::TRAINING_UNSUPPORTED_ALGORITHM
        );
    }

    #[test]
    fn test_display_includes_code() {
        let err = ChurnError::ArtifactNotFound {
            org_id: "org-1".into(),
        };
        let text = err.to_string();
        assert!(text.starts_with("[E2001]"));
        assert!(text.contains("Please train a model first"));
    }

    #[test]
    fn test_tuple_variants_render_code_and_payload() {
        assert_eq!(
            ChurnError::InvalidFraction(1.5).to_string(),
            "[E1001] Invalid test fraction 1.5: must be within [0, 1)"
        );
        assert!(ChurnError::UnsupportedAlgorithm("svm".into())
            .to_string()
            .starts_with("[E4001] Unsupported algorithm 'svm'."));
        assert_eq!(
            ChurnError::StorageUnavailable("refused".into()).to_string(),
            "[E3000] Storage unavailable: refused"
        );
        assert_eq!(
            ChurnError::internal("boom").to_string(),
            "[E5000] Stage failed: boom"
        );
    }

    #[test]
    fn test_storage_error_mapping() {
        let err: ChurnError = StorageError::not_found("dataset abc").into();
        assert!(err.is_not_found());

        let err: ChurnError = StorageError::unavailable("refused").into();
        assert!(matches!(err, ChurnError::StorageUnavailable(_)));
        assert!(err.is_retryable());
    }
}
