/// Errors surfaced by reconcilers and their collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Backend unreachable or misbehaving. The caller may retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote mutation was rejected. The message is meant for the user as-is.
    #[error("{0}")]
    Domain(String),

    /// A point read for a resolved id came back empty.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl SyncError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
