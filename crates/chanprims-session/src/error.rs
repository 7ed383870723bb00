/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Channel allocation failed.
    #[error("channel allocation failed: {0}")]
    Alloc(#[from] chanprims_alloc::AllocError),

    /// No open session on the given channel.
    #[error("no session open on channel {0}")]
    UnknownChannel(u16),

    /// A session is already recorded on the channel the allocator returned.
    #[error("channel {0} already has an open session")]
    SessionExists(u16),

    /// Invalid session configuration.
    #[error("invalid session config: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
