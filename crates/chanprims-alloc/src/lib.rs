//! Channel-number allocation for multiplexed connections.
//!
//! An AMQP-style connection carries many logical channels over one transport.
//! Each channel is identified by a 16-bit number:
//! - Channel 0 is the connection-control channel and is never handed out
//! - Channels 1..=channel_max are allocated on demand and reused after release
//!
//! [`ChannelAllocator`] always hands out the lowest free number, so channel ids
//! stay small and allocation order is deterministic.

pub mod allocator;
pub mod channel;
pub mod error;
pub mod lease;

pub use allocator::ChannelAllocator;
pub use channel::{ChannelMax, CONTROL, DEFAULT_CHANNEL_MAX, FIRST_CHANNEL};
pub use error::{AllocError, Result};
pub use lease::ChannelLease;
