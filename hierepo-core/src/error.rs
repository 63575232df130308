//! Error taxonomy for the workspace layer
//!
//! Remote errors are carried through unmodified; usage errors are raised
//! before any remote call is made.

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors surfaced by the service facade and the workspace layer
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Item exists: {0}")]
    ItemExists(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Version error: {0}")]
    Version(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid item state: {0}")]
    InvalidItemState(String),

    #[error("No such node type: {0}")]
    NoSuchNodeType(String),

    #[error("No such workspace: {0}")]
    NoSuchWorkspace(String),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Malformed path: {0}")]
    MalformedPath(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    /// Whether the error was raised for a caller mistake rather than by the
    /// backend.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            RepositoryError::IllegalArgument(_) | RepositoryError::InvalidPayload(_)
        )
    }

    /// Wrap an error with a message describing the violated expectation.
    pub fn internal(context: impl std::fmt::Display, source: &RepositoryError) -> Self {
        RepositoryError::Internal(format!("{}: {}", context, source))
    }
}
