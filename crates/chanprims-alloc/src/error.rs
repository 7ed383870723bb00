/// Errors returned by channel allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum AllocError {
    /// Every channel number in range is in use.
    ///
    /// Not retryable on the same connection; the caller needs a new connection.
    #[error("connection cannot support any more channels; open a new connection")]
    ChannelsExhausted,

    /// The requested channel number is already allocated.
    #[error("requested channel {0} is already in use")]
    ChannelInUse(u16),

    /// The requested channel number is the control channel or above `channel_max`.
    #[error("invalid channel number {channel} (valid range 1..={channel_max})")]
    InvalidChannelNumber { channel: u16, channel_max: u16 },
}

impl AllocError {
    /// The channel number the error is about, if any.
    ///
    /// Exhaustion concerns the whole pool and carries no channel.
    pub fn channel(&self) -> Option<u16> {
        match self {
            AllocError::ChannelsExhausted => None,
            AllocError::ChannelInUse(channel) => Some(*channel),
            AllocError::InvalidChannelNumber { channel, .. } => Some(*channel),
        }
    }

    /// Returns true for the exhaustion case.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, AllocError::ChannelsExhausted)
    }
}

pub type Result<T> = std::result::Result<T, AllocError>;
