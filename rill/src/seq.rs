//! Sequence coordination between publishers and subscribers.
//!
//! A [`Sequencer`] hands out monotonically increasing sequence
//! numbers to publishers and tracks a `cursor`: the sequence
//! below which every message is visible to subscribers. Each
//! subscriber owns a [`Barrier`], its consumed watermark,
//! registered with the sequencer so that publishers never claim
//! a sequence that would overwrite data a subscriber hasn't
//! passed yet.
//!
//! Both sides are single-attempt (`try_*`) operations: callers
//! that can't make progress re-poll after yielding back to the
//! scheduler, so no worker thread is ever parked here.

use core::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Allocator of sequence numbers for one channel.
#[derive(Debug)]
pub(crate) struct Sequencer {
    /// Ring capacity. Always a power of two.
    capacity: u64,

    /// Maximum number of sequences granted
    /// by a single claim.
    stride: u64,

    /// The sequence number that will be granted
    /// to the _next_ claiming publisher.
    next_claimable: AtomicU64,

    /// The sequence number of the next message that
    /// will become visible to subscribers.
    ///
    /// All messages with sequences less than this
    /// number are published and readable.
    cursor: AtomicU64,

    /// The consumed watermarks of every subscriber.
    ///
    /// All sequences less than the _lowest_ of these
    /// are assumed to be overwritable. Watermarks of
    /// dropped subscribers are skipped.
    barriers: Mutex<Vec<Weak<AtomicU64>>>,
}

impl Sequencer {
    pub(crate) fn new(capacity: usize, stride: usize) -> Self {
        Self {
            capacity: capacity as u64,
            stride: stride as u64,
            next_claimable: AtomicU64::new(0),
            cursor: AtomicU64::new(0),
            barriers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the sequence number below which every
    /// message is published.
    pub(crate) fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Maximum sequences granted per claim.
    pub(crate) fn stride(&self) -> u64 {
        self.stride
    }

    /// Registers and returns a new subscriber barrier,
    /// starting at the current cursor.
    pub(crate) fn add_barrier(&self) -> Barrier {
        let consumed = Arc::new(AtomicU64::new(self.cursor()));
        self.barriers.lock().push(Arc::downgrade(&consumed));
        Barrier { consumed }
    }

    /// Returns the lowest consumed watermark across all
    /// live subscribers, defaulting to the cursor when
    /// no subscriber is registered.
    fn min_consumed(&self) -> u64 {
        let mut min = self.cursor();
        for barrier in self.barriers.lock().iter() {
            if let Some(consumed) = barrier.upgrade() {
                min = min.min(consumed.load(Ordering::SeqCst));
            }
        }
        min
    }

    /// Tries to claim a contiguous range of up to
    /// `want` sequences.
    ///
    /// Grants fewer than `want` when the ring is nearly
    /// full, and never more than the stride. Returns
    /// `None` when the ring is full or the claim lost a
    /// race; the caller should yield and retry.
    ///
    /// Every granted range _must_ eventually be passed to
    /// [`Self::try_publish`], or the cursor stalls for
    /// every other publisher on the channel.
    pub(crate) fn try_claim(&self, want: u64) -> Option<Range<u64>> {
        let next = self.next_claimable.load(Ordering::SeqCst);

        let free = (self.min_consumed() + self.capacity).saturating_sub(next);
        if free == 0 {
            return None;
        }

        let granted = want.min(self.stride).min(free).max(1);
        self.next_claimable
            .compare_exchange(next, next + granted, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;

        Some(next..next + granted)
    }

    /// Tries to mark `sequences` as published, returning
    /// true iff the cursor advanced.
    ///
    /// Ranges become visible strictly in claim order: a
    /// publisher that finished out of order fails here
    /// until its predecessors have published.
    pub(crate) fn try_publish(&self, sequences: Range<u64>) -> bool {
        self.cursor
            .compare_exchange(
                sequences.start,
                sequences.end,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// A subscriber's consumed watermark.
///
/// Dropping the barrier deregisters the subscriber:
/// the sequencer's weak reference dies with it, so a
/// finished subscriber never back-pressures the ring.
#[derive(Debug)]
pub(crate) struct Barrier {
    consumed: Arc<AtomicU64>,
}

impl Barrier {
    /// Returns the next sequence this subscriber
    /// has yet to consume.
    pub(crate) fn position(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Marks all sequences up to (and including)
    /// `sequence` as consumed.
    pub(crate) fn advance_to(&self, sequence: u64) {
        self.consumed.fetch_max(sequence + 1, Ordering::SeqCst);
    }
}
