use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Transport failures are retried in place; everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
