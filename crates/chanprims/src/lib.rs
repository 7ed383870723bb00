//! Channel-number allocation for multiplexed broker connections.
//!
//! chanprims hands out AMQP-style channel numbers for one connection: lowest
//! free number first, explicit requests checked for collisions, and released
//! numbers reused.
//!
//! # Crate Structure
//!
//! - [`alloc`] — The concurrency-safe channel allocator
//! - [`session`] — Session tracking and channel-limit negotiation (behind `session` feature)

/// Re-export allocator types.
pub mod alloc {
    pub use chanprims_alloc::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use chanprims_session::*;
}
