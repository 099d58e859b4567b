use thiserror::Error;

use agora_store::StoreError;

/// Why an access check refused an operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    #[error("You have blocked this user")]
    BlockedBySender,

    #[error("This user has blocked you")]
    BlockedByReceiver,

    #[error("Not a member of this conversation")]
    NotMember,

    #[error("Conversation is locked")]
    Locked,

    #[error("Group requires a PIN to join")]
    RequiresGroupPin,
}

/// Errors surfaced by every engine operation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed input: empty text, missing attachment, over-long content.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The caller is not allowed to do this (editing someone else's message,
    /// managing a group they did not create).
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The target exists but its state forbids the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Access denied: {0}")]
    Access(#[from] AccessError),

    #[error("Incorrect PIN")]
    IncorrectPin,

    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage or a collaborator failed; the operation may be retried.
    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    #[error("No authenticated user")]
    Unauthenticated,
}

impl EngineError {
    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Validation(msg) => Self::Validation(msg),
            StoreError::Permission(msg) => Self::Permission(msg),
            StoreError::InvalidState(msg) => Self::InvalidState(msg),
            other => {
                tracing::error!(error = %other, "storage failure");
                Self::Transient(other.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
