use jobplane_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Pre-signed URL expired")]
    AccessExpired,
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Malformed pre-signed URL: {0}")]
    Malformed(String),
    #[error("Invalid object locator: {0}")]
    InvalidLocator(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl TransferError {
    /// Taxonomy kind for status reporting. Storage and transport faults are
    /// execution failures eligible for redelivery.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::AccessExpired => ErrorKind::AccessExpired,
            TransferError::AccessDenied(_) | TransferError::Malformed(_) => ErrorKind::AccessDenied,
            TransferError::InvalidLocator(_)
            | TransferError::NotFound(_)
            | TransferError::Storage(_)
            | TransferError::Transport(_) => ErrorKind::ExecutionError,
        }
    }
}
