use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached. Transient.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A partial update targeted a document that does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// A create targeted a document that already exists.
    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    /// The backend refused the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A document did not have the expected shape.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A path did not have the expected number of segments.
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Writes racing a concurrent delete fail this way during normal
    /// teardown. Callers log and move on.
    pub fn is_expected_teardown(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::PermissionDenied(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
