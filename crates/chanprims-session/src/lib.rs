//! Session management for multiplexed connections.
//!
//! A [`SessionManager`] is owned by one connection. It negotiates the channel
//! limit, owns the connection's [`ChannelAllocator`](chanprims_alloc::ChannelAllocator),
//! and tracks which session lives on which channel.

pub mod config;
pub mod error;
pub mod manager;
pub mod negotiate;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use manager::{SessionInfo, SessionManager};
pub use negotiate::negotiate_channel_max;
