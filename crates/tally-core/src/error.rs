//! Error types for tally records.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Structural problems that make a record unacceptable.
///
/// Ingested records failing these checks are logged and dropped; locally
/// authored records get the error back before anything touches the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field is empty.
    #[error("field '{field}' must not be empty")]
    EmptyField {
        /// The wire name of the empty field.
        field: &'static str,
    },

    /// A poll offers fewer options than the minimum.
    #[error("poll needs at least {min} options, got {count}")]
    TooFewOptions {
        /// Number of options present.
        count: usize,
        /// Minimum accepted.
        min: usize,
    },

    /// One of the poll options is empty.
    #[error("option {index} must not be empty")]
    EmptyOption {
        /// Position of the empty option.
        index: usize,
    },

    /// A timestamp field is zero or negative.
    #[error("field '{field}' must be positive, got {value}")]
    NonPositiveTimestamp {
        /// The wire name of the timestamp field.
        field: &'static str,
        /// The rejected value.
        value: i64,
    },

    /// A vote claims to be cast further in the future than clock skew allows.
    #[error("castAt {cast_at} is beyond the accepted clock skew (latest accepted {latest})")]
    FromTheFuture {
        /// The claimed cast time (Unix millis).
        cast_at: i64,
        /// Latest acceptable cast time at validation (Unix millis).
        latest: i64,
    },
}

impl ValidationError {
    /// Short stable label, used as a metrics label value.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::EmptyField { .. } => "empty_field",
            Self::TooFewOptions { .. } => "too_few_options",
            Self::EmptyOption { .. } => "empty_option",
            Self::NonPositiveTimestamp { .. } => "non_positive_timestamp",
            Self::FromTheFuture { .. } => "from_the_future",
        }
    }
}

/// Errors that can occur while encoding, decoding or validating records.
#[derive(Error, Debug)]
pub enum Error {
    /// The record failed structural validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Display formatting
    // =========================================================================

    #[test]
    fn test_empty_field_display() {
        let err = ValidationError::EmptyField { field: "question" };
        assert_eq!(err.to_string(), "field 'question' must not be empty");
    }

    #[test]
    fn test_too_few_options_display() {
        let err = ValidationError::TooFewOptions { count: 1, min: 2 };
        let msg = err.to_string();
        assert!(msg.contains("at least 2"));
        assert!(msg.contains("got 1"));
    }

    #[test]
    fn test_from_the_future_display() {
        let err = ValidationError::FromTheFuture {
            cast_at: 2_000,
            latest: 1_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("2000"));
        assert!(msg.contains("1000"));
    }

    #[test]
    fn test_reason_labels_are_distinct() {
        let errors = [
            ValidationError::EmptyField { field: "id" },
            ValidationError::TooFewOptions { count: 0, min: 2 },
            ValidationError::EmptyOption { index: 0 },
            ValidationError::NonPositiveTimestamp {
                field: "createdAt",
                value: 0,
            },
            ValidationError::FromTheFuture {
                cast_at: 1,
                latest: 0,
            },
        ];
        let mut reasons: Vec<_> = errors.iter().map(|e| e.reason()).collect();
        reasons.sort();
        reasons.dedup();
        assert_eq!(reasons.len(), errors.len());
    }

    // =========================================================================
    // From conversions
    // =========================================================================

    #[test]
    fn test_from_validation_error() {
        let err: Error = ValidationError::EmptyOption { index: 3 }.into();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("option 3"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
