//! Error types for record decoding.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while converting wire rows to records.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The wire row is not a JSON object.
    #[error("wire row is not a JSON object")]
    NotAnObject,

    /// A required envelope column is absent.
    #[error("wire row is missing required field `{0}`")]
    MissingField(&'static str),

    /// An envelope column has an unexpected JSON type.
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),

    /// A timestamp column failed to parse as RFC 3339.
    #[error("invalid timestamp in field `{field}`")]
    InvalidTimestamp {
        /// Name of the offending column.
        field: &'static str,
        /// Parse failure.
        #[source]
        source: chrono::ParseError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ModelError::MissingField("id");
        assert_eq!(err.to_string(), "wire row is missing required field `id`");

        let err = ModelError::NotAnObject;
        assert!(err.to_string().contains("JSON object"));
    }
}
