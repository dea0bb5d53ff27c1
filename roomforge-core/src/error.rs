use std::error::Error as StdError;

/// Errors returned when talking to a container runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The referenced container or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// An image build failed.
    #[error("image build failed: {0}")]
    Build(String),
    /// The runtime rejected or failed an API call.
    #[error("runtime api error: {0}")]
    Api(String),
    /// The runtime daemon cannot be reached at all.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    /// Local I/O failed while preparing runtime input.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Any other error.
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl RuntimeError {
    /// Whether this error means the target container/image is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}
