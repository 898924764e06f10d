//! Core error types for CADENCE.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Validation error
    Validation {
        /// Offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },
}

impl CoreError {
    /// Shorthand for a validation failure
    #[must_use]
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_shorthand() {
        let err = CoreError::validation("worker_slots", "must be at least 1");
        assert_eq!(
            err.to_string(),
            "Validation failed for worker_slots: must be at least 1"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(
            CoreError::validation("aging", "threshold must be non-zero"),
            CoreError::Validation {
                field: "aging".to_string(),
                reason: "threshold must be non-zero".to_string(),
            }
        );
        assert_ne!(
            CoreError::validation("aging", "x"),
            CoreError::validation("worker_slots", "x")
        );
    }

    #[test]
    fn test_error_source_is_none() {
        use std::error::Error;

        let err = CoreError::validation("slice_interval", "must be non-zero");
        assert!(err.source().is_none());
    }
}
