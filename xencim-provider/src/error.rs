//! Error types for the provider dispatch framework.
//!
//! Two layers of errors exist:
//! - [`BackendError`] - a pool RPC failed (connectivity, backend rejection).
//! - [`ProviderError`] - the protocol-level outcome of a dispatch operation.
//!
//! Backend errors are converted into provider errors at the dispatch boundary,
//! where they are enriched with the operation and class being served.

use thiserror::Error;

/// CMPI status code numbers surfaced to the management protocol.
pub mod status {
    pub const OK: u32 = 0;
    pub const FAILED: u32 = 1;
    pub const INVALID_PARAMETER: u32 = 4;
    pub const NOT_FOUND: u32 = 6;
    pub const NOT_SUPPORTED: u32 = 7;
    pub const ALREADY_EXISTS: u32 = 11;
    pub const METHOD_NOT_FOUND: u32 = 17;
    pub const DO_NOT_UNLOAD: u32 = 50;
}

/// Errors raised by a pool backend or one of its sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Could not reach the pool or log in.
    #[error("Failed to connect to pool: {0}")]
    ConnectionFailed(String),

    /// The session was logged out or never authenticated.
    #[error("Session is no longer valid: {0}")]
    SessionInvalid(String),

    /// An object reference does not resolve to a live backend object.
    #[error("Handle is invalid: {0}")]
    HandleInvalid(String),

    /// The backend rejected the call.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Internal error (poisoned lock, broken invariant).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Protocol-level outcome of a dispatch, job or lifecycle operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The class or the operation is legitimately not implemented.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Enumeration exhausted or the requested object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An add would create a duplicate.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Malformed identity, missing key, or bad method argument.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Method name unknown to a class that does support methods.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// The provider has not been initialized (or has been unloaded).
    #[error("Provider is not initialized")]
    NotInitialized,

    /// Operational failure, enriched with where it happened.
    #[error("{operation} on {class_name} failed: {detail}")]
    Failed {
        operation: String,
        class_name: String,
        detail: String,
    },
}

impl ProviderError {
    /// Create a `Failed` error for an operation on a class.
    pub fn failed(
        operation: impl Into<String>,
        class_name: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        ProviderError::Failed {
            operation: operation.into(),
            class_name: class_name.into(),
            detail: detail.into(),
        }
    }

    /// Attach operation and class context to an error that lacks it.
    ///
    /// Errors already carrying context keep their original location.
    pub fn within(self, operation: &str, class_name: &str) -> Self {
        match self {
            ProviderError::Failed { operation: op, detail, .. } if op.is_empty() => {
                ProviderError::failed(operation, class_name, detail)
            }
            other => other,
        }
    }

    /// CMPI status code for this error.
    pub fn status_code(&self) -> u32 {
        match self {
            ProviderError::NotSupported(_) => status::NOT_SUPPORTED,
            ProviderError::NotFound(_) => status::NOT_FOUND,
            ProviderError::AlreadyExists(_) => status::ALREADY_EXISTS,
            ProviderError::InvalidParameter(_) => status::INVALID_PARAMETER,
            ProviderError::MethodNotFound(_) => status::METHOD_NOT_FOUND,
            ProviderError::NotInitialized | ProviderError::Failed { .. } => status::FAILED,
        }
    }

    /// Whether this error is `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

impl From<BackendError> for ProviderError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::HandleInvalid(handle) => ProviderError::NotFound(handle),
            other => ProviderError::Failed {
                operation: String::new(),
                class_name: String::new(),
                detail: other.to_string(),
            },
        }
    }
}

/// Result type alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
