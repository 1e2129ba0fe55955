use jobplane_storage::TransferError;
use jobplane_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Pre-signed input or output transfer failed
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
    /// No handler registered for the pipeline reference
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),
    /// Handler returned an error
    #[error("Execution error: {0}")]
    Execution(String),
    /// Pool grant missing, expired or not issued by this pool
    #[error("Unauthorized assignment: {0}")]
    Unauthorized(String),
    /// No free worker slot
    #[error("Worker pool saturated")]
    Saturated,
    /// Status callback failed
    #[error("Callback error: {0}")]
    Callback(String),
    /// Worker terminated without producing a result
    #[error("Worker crashed: {0}")]
    Crashed(String),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Transfer(e) => e.kind(),
            ExecutorError::Unauthorized(_) => ErrorKind::AuthDenied,
            ExecutorError::UnknownPipeline(_)
            | ExecutorError::Execution(_)
            | ExecutorError::Saturated
            | ExecutorError::Callback(_)
            | ExecutorError::Crashed(_) => ErrorKind::ExecutionError,
        }
    }
}
