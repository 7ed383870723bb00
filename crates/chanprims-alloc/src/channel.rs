//! Channel numbering.
//!
//! Channel 0 is reserved for connection control.
//! Channels 1..=channel_max are available to sessions.

use std::fmt;
use std::num::NonZeroU16;

/// Connection management (open, tune, close, heartbeats).
pub const CONTROL: u16 = 0;

/// First allocatable channel number.
pub const FIRST_CHANNEL: u16 = 1;

/// Channel limit used when nothing else is configured.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

/// Upper bound on channel numbers for one connection.
///
/// Always at least 1. A negotiated value of 0 means "no limit" on the wire and
/// maps to [`ChannelMax::UNLIMITED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelMax(NonZeroU16);

impl ChannelMax {
    /// The practical bound used when the peer negotiates "no limit".
    pub const UNLIMITED: ChannelMax = ChannelMax(NonZeroU16::MAX);

    /// Create a bound. Returns `None` for 0.
    pub fn new(max: u16) -> Option<Self> {
        NonZeroU16::new(max).map(Self)
    }

    /// Translate a protocol-negotiated value, where 0 means no limit.
    pub fn from_negotiated(max: u16) -> Self {
        Self::new(max).unwrap_or(Self::UNLIMITED)
    }

    /// The highest allocatable channel number.
    pub fn get(self) -> u16 {
        self.0.get()
    }

    /// Returns true if `channel` is in `1..=max`.
    pub fn contains(self, channel: u16) -> bool {
        channel != CONTROL && channel <= self.get()
    }

    /// The value to put back on the wire, where the unlimited bound becomes 0.
    pub fn to_negotiated(self) -> u16 {
        if self == Self::UNLIMITED {
            0
        } else {
            self.get()
        }
    }
}

impl Default for ChannelMax {
    fn default() -> Self {
        Self::from_negotiated(DEFAULT_CHANNEL_MAX)
    }
}

impl fmt::Display for ChannelMax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Returns true if the channel is the connection-control channel.
pub fn is_control(id: u16) -> bool {
    id == CONTROL
}
