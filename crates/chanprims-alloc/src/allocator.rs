use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::{ChannelMax, FIRST_CHANNEL};
use crate::error::{AllocError, Result};
use crate::lease::ChannelLease;

const WORD_BITS: usize = u64::BITS as usize;

/// Bitset of allocated channel numbers, indexed directly by channel number.
///
/// Bit 0 (the control channel) is never set.
#[derive(Debug)]
struct ChannelSet {
    words: Vec<u64>,
    max: u16,
    /// Lowest number that may be free. Every number in `1..cursor` is allocated.
    cursor: u32,
    count: usize,
}

impl ChannelSet {
    fn new(max: ChannelMax) -> Self {
        let max = max.get();
        Self {
            words: vec![0; max as usize / WORD_BITS + 1],
            max,
            cursor: u32::from(FIRST_CHANNEL),
            count: 0,
        }
    }

    fn contains(&self, channel: u16) -> bool {
        let idx = channel as usize;
        self.words[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS)) != 0
    }

    fn insert(&mut self, channel: u16) {
        let idx = channel as usize;
        self.words[idx / WORD_BITS] |= 1u64 << (idx % WORD_BITS);
        self.count += 1;
    }

    fn remove(&mut self, channel: u16) -> bool {
        if !self.contains(channel) {
            return false;
        }
        let idx = channel as usize;
        self.words[idx / WORD_BITS] &= !(1u64 << (idx % WORD_BITS));
        self.count -= 1;
        if u32::from(channel) < self.cursor {
            self.cursor = u32::from(channel);
        }
        true
    }

    fn lowest_free(&self) -> Option<u16> {
        let max = self.max as usize;
        let mut idx = self.cursor as usize;
        while idx <= max {
            let word_idx = idx / WORD_BITS;
            // Treat bits below `idx` as taken so the scan starts at the cursor.
            let word = self.words[word_idx] | ((1u64 << (idx % WORD_BITS)) - 1);
            if word != u64::MAX {
                let candidate = word_idx * WORD_BITS + (!word).trailing_zeros() as usize;
                return (candidate <= max).then_some(candidate as u16);
            }
            idx = (word_idx + 1) * WORD_BITS;
        }
        None
    }

    fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_idx, &word)| {
                (0..WORD_BITS)
                    .filter(move |bit| word & (1u64 << bit) != 0)
                    .map(move |bit| (word_idx * WORD_BITS + bit) as u16)
            })
    }
}

/// Allocates channel numbers for one connection.
///
/// All operations take `&self` and are serialized by an internal lock held
/// only for the scan-and-update step, so one allocator can be shared between
/// threads through an [`Arc`]. Allocation always returns the lowest free
/// number in `1..=channel_max`.
///
/// The allocator does no logging and no retrying; errors go straight back to
/// the caller.
#[derive(Debug)]
pub struct ChannelAllocator {
    channel_max: ChannelMax,
    state: Mutex<ChannelSet>,
}

impl ChannelAllocator {
    /// Create an allocator for channels `1..=channel_max`.
    pub fn new(channel_max: ChannelMax) -> Self {
        Self {
            channel_max,
            state: Mutex::new(ChannelSet::new(channel_max)),
        }
    }

    /// Create an allocator from a protocol-negotiated limit (0 = no limit).
    pub fn from_negotiated(channel_max: u16) -> Self {
        Self::new(ChannelMax::from_negotiated(channel_max))
    }

    /// The configured upper bound.
    pub fn channel_max(&self) -> ChannelMax {
        self.channel_max
    }

    /// Allocate the lowest free channel number.
    ///
    /// Fails with [`AllocError::ChannelsExhausted`] when every number is taken.
    pub fn allocate_next(&self) -> Result<u16> {
        let mut set = self.lock();
        let channel = set.lowest_free().ok_or(AllocError::ChannelsExhausted)?;
        set.insert(channel);
        set.cursor = u32::from(channel) + 1;
        Ok(channel)
    }

    /// Allocate a caller-chosen channel number.
    ///
    /// Fails with [`AllocError::InvalidChannelNumber`] for 0 or numbers above
    /// `channel_max`, and with [`AllocError::ChannelInUse`] if the number is
    /// already allocated.
    pub fn allocate_specific(&self, channel: u16) -> Result<u16> {
        if !self.channel_max.contains(channel) {
            return Err(AllocError::InvalidChannelNumber {
                channel,
                channel_max: self.channel_max.get(),
            });
        }

        let mut set = self.lock();
        if set.contains(channel) {
            return Err(AllocError::ChannelInUse(channel));
        }
        set.insert(channel);
        Ok(channel)
    }

    /// Return a channel number to the pool.
    ///
    /// Releasing a number that is not allocated, or is out of range, does nothing.
    pub fn release(&self, channel: u16) {
        if !self.channel_max.contains(channel) {
            return;
        }
        self.lock().remove(channel);
    }

    /// Allocate the lowest free channel as a guard that releases it on drop.
    pub fn lease_next(self: &Arc<Self>) -> Result<ChannelLease> {
        let channel = self.allocate_next()?;
        Ok(ChannelLease::new(Arc::clone(self), channel))
    }

    /// Allocate a caller-chosen channel as a guard that releases it on drop.
    pub fn lease_specific(self: &Arc<Self>, channel: u16) -> Result<ChannelLease> {
        let channel = self.allocate_specific(channel)?;
        Ok(ChannelLease::new(Arc::clone(self), channel))
    }

    /// Returns true if `channel` is currently allocated.
    pub fn is_allocated(&self, channel: u16) -> bool {
        self.channel_max.contains(channel) && self.lock().contains(channel)
    }

    /// Number of channels currently allocated.
    pub fn allocated_count(&self) -> usize {
        self.lock().count
    }

    /// Number of channels still free.
    pub fn available(&self) -> usize {
        self.channel_max.get() as usize - self.lock().count
    }

    /// Returns true when no channel can be allocated.
    pub fn is_exhausted(&self) -> bool {
        self.available() == 0
    }

    /// Snapshot of allocated channel numbers in ascending order.
    pub fn allocated(&self) -> Vec<u16> {
        self.lock().iter().collect()
    }

    // Every update completes before anything that could panic, so a poisoned
    // lock still guards a consistent set.
    fn lock(&self) -> MutexGuard<'_, ChannelSet> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ChannelAllocator {
    fn default() -> Self {
        Self::new(ChannelMax::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;

    fn allocator(max: u16) -> ChannelAllocator {
        ChannelAllocator::new(ChannelMax::new(max).unwrap())
    }

    #[test]
    fn sequential_allocation_until_exhausted() {
        let alloc = allocator(5);
        for expected in 1..=5 {
            assert_eq!(alloc.allocate_next().unwrap(), expected);
        }
        assert_eq!(alloc.allocate_next(), Err(AllocError::ChannelsExhausted));
        assert!(alloc.is_exhausted());
        assert_eq!(alloc.allocated_count(), 5);
    }

    #[test]
    fn specific_twice_reports_in_use() {
        let alloc = allocator(4);
        for channel in 1..=4 {
            assert_eq!(alloc.allocate_specific(channel).unwrap(), channel);
            assert_eq!(
                alloc.allocate_specific(channel),
                Err(AllocError::ChannelInUse(channel))
            );
        }
    }

    #[test]
    fn specific_out_of_range_is_invalid() {
        let alloc = allocator(3);
        assert_eq!(
            alloc.allocate_specific(0),
            Err(AllocError::InvalidChannelNumber {
                channel: 0,
                channel_max: 3
            })
        );
        assert_eq!(
            alloc.allocate_specific(4),
            Err(AllocError::InvalidChannelNumber {
                channel: 4,
                channel_max: 3
            })
        );
        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn release_makes_lowest_number_reusable() {
        let alloc = allocator(10);
        let first = alloc.allocate_next().unwrap();
        let second = alloc.allocate_next().unwrap();
        assert_eq!((first, second), (1, 2));

        alloc.release(first);
        assert!(!alloc.is_allocated(first));
        assert_eq!(alloc.allocate_next().unwrap(), 1);
        assert_eq!(alloc.allocate_next().unwrap(), 3);
    }

    #[test]
    fn double_release_is_noop() {
        let alloc = allocator(4);
        alloc.allocate_next().unwrap();
        alloc.allocate_next().unwrap();

        alloc.release(1);
        alloc.release(1);
        assert_eq!(alloc.allocated_count(), 1);
        assert_eq!(alloc.allocated(), vec![2]);

        assert_eq!(alloc.allocate_next().unwrap(), 1);
        assert_eq!(alloc.allocate_next().unwrap(), 3);
    }

    #[test]
    fn release_unknown_or_out_of_range_is_noop() {
        let alloc = allocator(3);
        alloc.release(0);
        alloc.release(2);
        alloc.release(4);
        alloc.release(u16::MAX);
        assert_eq!(alloc.allocated_count(), 0);
        assert_eq!(alloc.allocate_next().unwrap(), 1);
    }

    #[test]
    fn next_skips_specifically_allocated_numbers() {
        let alloc = allocator(6);
        alloc.allocate_specific(1).unwrap();
        alloc.allocate_specific(3).unwrap();
        assert_eq!(alloc.allocate_next().unwrap(), 2);
        assert_eq!(alloc.allocate_next().unwrap(), 4);
        alloc.allocate_specific(5).unwrap();
        assert_eq!(alloc.allocate_next().unwrap(), 6);
        assert_eq!(alloc.allocate_next(), Err(AllocError::ChannelsExhausted));
    }

    #[test]
    fn lowest_free_across_word_boundaries() {
        let alloc = allocator(130);
        for _ in 1..=130 {
            alloc.allocate_next().unwrap();
        }
        alloc.release(128);
        alloc.release(64);
        alloc.release(63);

        assert_eq!(alloc.allocate_next().unwrap(), 63);
        assert_eq!(alloc.allocate_next().unwrap(), 64);
        assert_eq!(alloc.allocate_next().unwrap(), 128);
        assert_eq!(alloc.allocate_next(), Err(AllocError::ChannelsExhausted));
    }

    #[test]
    fn bound_on_word_edge() {
        let alloc = allocator(64);
        for expected in 1..=64 {
            assert_eq!(alloc.allocate_next().unwrap(), expected);
        }
        assert_eq!(alloc.allocate_next(), Err(AllocError::ChannelsExhausted));
    }

    #[test]
    fn unlimited_covers_full_u16_range() {
        let alloc = ChannelAllocator::from_negotiated(0);
        assert_eq!(alloc.channel_max(), ChannelMax::UNLIMITED);
        assert_eq!(alloc.allocate_specific(u16::MAX).unwrap(), u16::MAX);

        for expected in 1..u16::MAX {
            assert_eq!(alloc.allocate_next().unwrap(), expected);
        }
        assert_eq!(alloc.allocate_next(), Err(AllocError::ChannelsExhausted));
        assert_eq!(alloc.available(), 0);
    }

    #[test]
    fn allocated_snapshot_is_sorted() {
        let alloc = allocator(200);
        for channel in [150, 3, 70, 1] {
            alloc.allocate_specific(channel).unwrap();
        }
        assert_eq!(alloc.allocated(), vec![1, 3, 70, 150]);
        assert_eq!(alloc.available(), 196);
        assert!(alloc.is_allocated(70));
        assert!(!alloc.is_allocated(0));
        assert!(!alloc.is_allocated(201));
    }

    #[test]
    fn three_channel_connection_scenario() {
        let alloc = allocator(3);
        assert_eq!(alloc.allocate_next().unwrap(), 1);
        assert_eq!(alloc.allocate_next().unwrap(), 2);
        assert_eq!(
            alloc.allocate_specific(1),
            Err(AllocError::ChannelInUse(1))
        );
        alloc.release(1);
        assert_eq!(alloc.allocate_specific(1).unwrap(), 1);
        assert_eq!(alloc.allocate_next().unwrap(), 3);
        assert_eq!(alloc.allocate_next(), Err(AllocError::ChannelsExhausted));
    }

    #[test]
    fn concurrent_allocation_yields_distinct_numbers() {
        const THREADS: usize = 16;
        const PER_THREAD: usize = 64;

        let alloc = Arc::new(allocator(2047));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| alloc.allocate_next().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        let expected: Vec<u16> = (1..=(THREADS * PER_THREAD) as u16).collect();
        assert_eq!(all, expected);
        assert_eq!(alloc.allocated_count(), THREADS * PER_THREAD);
    }

    #[test]
    fn concurrent_churn_never_double_allocates() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;

        let alloc = Arc::new(allocator(THREADS as u16));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let channel = alloc.allocate_next().unwrap();
                        assert!(alloc.is_allocated(channel));
                        alloc.release(channel);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(alloc.allocated_count(), 0);
        assert_eq!(alloc.allocate_next().unwrap(), 1);
    }

    #[test]
    fn concurrent_specific_requests_have_one_winner() {
        let alloc = Arc::new(allocator(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || alloc.allocate_specific(5))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let losers: HashSet<_> = results.iter().filter_map(|r| r.err()).collect();

        assert_eq!(winners, 1);
        assert_eq!(losers, HashSet::from([AllocError::ChannelInUse(5)]));
    }

    #[test]
    fn poisoned_lock_still_serves_requests() {
        let alloc = Arc::new(allocator(3));
        assert_eq!(alloc.allocate_next().unwrap(), 1);

        let holder = Arc::clone(&alloc);
        let joined = thread::spawn(move || {
            let _guard = holder.state.lock().unwrap();
            panic!("panic while holding the allocator lock");
        })
        .join();
        assert!(joined.is_err());
        assert!(alloc.state.is_poisoned());

        alloc.release(1);
        assert!(!alloc.is_allocated(1));
        assert_eq!(alloc.allocate_next().unwrap(), 1);
        assert_eq!(
            alloc.allocate_specific(1),
            Err(AllocError::ChannelInUse(1))
        );
        assert_eq!(alloc.allocate_specific(3).unwrap(), 3);
        assert_eq!(alloc.allocated(), vec![1, 3]);
    }

    #[test]
    fn lease_releases_on_drop() {
        let alloc = Arc::new(allocator(2));
        {
            let lease = alloc.lease_next().unwrap();
            assert_eq!(lease.channel(), 1);
            assert!(alloc.is_allocated(1));
        }
        assert!(!alloc.is_allocated(1));

        let kept = alloc.lease_specific(2).unwrap().into_channel();
        assert_eq!(kept, 2);
        assert!(alloc.is_allocated(2));
        assert_eq!(
            alloc.lease_specific(2).unwrap_err(),
            AllocError::ChannelInUse(2)
        );
    }
}
