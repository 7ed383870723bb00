use std::sync::Arc;

use crate::allocator::ChannelAllocator;

/// An allocated channel number that is released when dropped.
///
/// Obtained from [`ChannelAllocator::lease_next`] or
/// [`ChannelAllocator::lease_specific`].
#[derive(Debug)]
#[must_use = "dropping a lease releases its channel immediately"]
pub struct ChannelLease {
    allocator: Arc<ChannelAllocator>,
    channel: u16,
    armed: bool,
}

impl ChannelLease {
    pub(crate) fn new(allocator: Arc<ChannelAllocator>, channel: u16) -> Self {
        Self {
            allocator,
            channel,
            armed: true,
        }
    }

    /// The leased channel number.
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Keep the channel allocated and hand ownership of the number to the caller.
    ///
    /// The caller becomes responsible for calling [`ChannelAllocator::release`].
    pub fn into_channel(mut self) -> u16 {
        self.armed = false;
        self.channel
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.armed {
            self.allocator.release(self.channel);
        }
    }
}
