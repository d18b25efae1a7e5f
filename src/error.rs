use thiserror::Error;

/// Main error type for the metricforge loss engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForgeError {
    /// Shape-related errors: batch length disagreement, dimension mismatch
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Mathematical domain violations (e.g. a condensed lookup with i == j)
    #[error("Domain error: {0}")]
    DomainError(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown distance/strategy names or out-of-range hyperparameters
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Internal errors that shouldn't happen
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ForgeError {
    /// Create a shape error with an optional suggestion
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        ForgeError::ShapeError(message)
    }

    /// Create a domain error naming the offending operation
    pub fn domain_error(operation: &str, message: &str) -> Self {
        ForgeError::DomainError(format!("{}: {}", operation, message))
    }

    /// Create a configuration error for an unrecognised name
    pub fn unknown_name(kind: &str, name: &str, expected: &[&str]) -> Self {
        ForgeError::ConfigurationError(format!(
            "Unknown {} '{}', expected one of: {}",
            kind,
            name,
            expected.join(", ")
        ))
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        ForgeError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for ForgeError {
    fn from(err: bincode::Error) -> Self {
        ForgeError::SerializationError(err.to_string())
    }
}

/// Result type for metricforge operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    DomainViolation,
    InvalidOperation,
    ConfigInvalid,
    SerializationFailed,
    InternalError,
}

impl ForgeError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            ForgeError::ShapeError(_) => ErrorCode::ShapeMismatch,
            ForgeError::DomainError(_) => ErrorCode::DomainViolation,
            ForgeError::InvalidInput(_) => ErrorCode::InvalidOperation,
            ForgeError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            ForgeError::SerializationError(_) => ErrorCode::SerializationFailed,
            ForgeError::IoError(_) => ErrorCode::InvalidOperation,
            ForgeError::InternalError(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the training loop can reasonably skip the batch and continue.
    ///
    /// Shape and domain errors come from a malformed batch; configuration
    /// errors mean the loss itself is unusable.
    pub fn is_batch_local(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ShapeMismatch | ErrorCode::DomainViolation | ErrorCode::InvalidOperation
        )
    }
}
