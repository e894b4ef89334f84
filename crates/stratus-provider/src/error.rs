//! Provider error types.

use thiserror::Error;

/// Result type alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by a provider backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected or failed the request.
    #[error("{operation}: {message}")]
    Request { operation: String, message: String },

    /// A resource is still referenced (by an instance or another group's rule).
    #[error("{operation}: {resource} is still in use")]
    DependencyViolation { operation: String, resource: String },

    #[error("{operation}: {resource} not found")]
    NotFound { operation: String, resource: String },
}

impl ProviderError {
    pub fn request(operation: &str, err: impl std::fmt::Display) -> Self {
        ProviderError::Request {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            ProviderError::Request { operation, .. }
            | ProviderError::DependencyViolation { operation, .. }
            | ProviderError::NotFound { operation, .. } => operation,
        }
    }
}

impl From<ProviderError> for stratus_core::Error {
    fn from(err: ProviderError) -> Self {
        stratus_core::Error::ProviderRequest {
            operation: err.operation().to_string(),
            message: err.to_string(),
        }
    }
}
