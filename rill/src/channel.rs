//! Bounded ring channels between routines.
//!
//! A channel is a fixed-capacity circular buffer of
//! [`Envelope`]s bound to one [`Sequencer`] and one barrier
//! per subscriber. Publishers claim sequence ranges, write
//! the matching slots, and publish; subscribers wait on the
//! cursor and read slots by reference, cloning the payload
//! out on delivery.
//!
//! The channel also owns the shutdown state machine for its
//! little corner of the network: subscribers start and finish
//! termination, publishers confirm it, and the state only
//! ever moves forward.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::Range,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};
use std::{collections::VecDeque, sync::Arc};

use crate::{
    async_support,
    seq::{Barrier, Sequencer},
    Flows,
};

/// Shutdown progress of a channel, driven only by the
/// routine drivers attached to it.
///
/// The state is monotone: transitions apply `max(current,
/// target)`, so it never regresses no matter how many
/// drivers report the same step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum TerminationState {
    /// Normal operation.
    Open = 0,

    /// A subscriber observed cancellation and stopped
    /// taking new batches.
    ShutdownStarted = 1,

    /// The publisher side noticed and stopped claiming
    /// fresh sequences.
    ShutdownConfirmed = 2,

    /// Every subscriber drained its in-flight messages
    /// and deregistered.
    Drained = 3,
}

impl From<u8> for TerminationState {
    fn from(value: u8) -> Self {
        match value {
            0 => TerminationState::Open,
            1 => TerminationState::ShutdownStarted,
            2 => TerminationState::ShutdownConfirmed,
            _ => TerminationState::Drained,
        }
    }
}

/// A message slot in the ring.
///
/// The envelope carries the metadata the drivers need and
/// is invisible to user callbacks: only the payload is ever
/// delivered. `terminal` marks sentinel envelopes published
/// during shutdown purely to advance the cursor past a
/// waiting subscriber; drivers never deliver those.
#[derive(Debug, Clone, Default)]
pub(crate) struct Envelope<T> {
    pub(crate) payload: T,
    pub(crate) sequence: u64,
    pub(crate) terminal: bool,
}

/// Scratch state owned by a publishing driver.
///
/// Holds the claimed sequence range and the messages staged
/// for it. A token is reused across iterations of its
/// driver's loop.
#[derive(Debug)]
pub(crate) struct PublishToken<T> {
    sequences: Option<Range<u64>>,
    messages: VecDeque<T>,
}

impl<T> Default for PublishToken<T> {
    fn default() -> Self {
        Self {
            sequences: None,
            messages: VecDeque::new(),
        }
    }
}

impl<T> PublishToken<T> {
    /// Stages `message` for the next unfilled sequence
    /// of the claimed range.
    pub(crate) fn stage(&mut self, message: T) {
        debug_assert!(self.messages.len() < self.claimed());
        self.messages.push_back(message);
    }

    /// Number of sequences granted by the active claim.
    pub(crate) fn claimed(&self) -> usize {
        self.sequences
            .as_ref()
            .map(|sequences| (sequences.end - sequences.start) as usize)
            .unwrap_or(0)
    }

    /// True iff every claimed sequence has a staged message.
    pub(crate) fn is_full(&self) -> bool {
        self.sequences.is_some() && self.messages.len() >= self.claimed()
    }

    /// True iff the token holds a claim that has not
    /// been published yet.
    pub(crate) fn has_claim(&self) -> bool {
        self.sequences.is_some()
    }
}

/// Scratch state owned by a subscribing driver.
#[derive(Debug)]
pub(crate) struct SubscriberToken<T> {
    /// This subscriber's consumed watermark. Dropping
    /// the token deregisters it from the sequencer.
    barrier: Barrier,

    /// Next sequence to read.
    pub(crate) next_to_read: u64,

    /// Last sequence of the current batch (inclusive).
    pub(crate) end_of_batch: u64,

    /// Last sequence acknowledged through the barrier.
    pub(crate) last_ack: u64,

    _message: PhantomData<T>,
}

/// A bounded multi-publisher multi-subscriber channel.
///
/// Cheap to clone; all clones share one ring.
#[derive(Debug)]
pub(crate) struct Channel<T: Flows> {
    shared: Arc<Shared<T>>,
}

impl<T: Flows> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    name: Box<str>,

    sequencer: Sequencer,

    /// Pre-allocated contiguous buffer of message slots.
    ///
    /// Each slot is wrapped in an [`UnsafeCell`] so the
    /// claiming publisher can write it while concurrent
    /// subscribers immutably read other slots; sequence
    /// publication is the happens-before edge between
    /// the two.
    buffer: Box<[UnsafeCell<Envelope<T>>]>,

    /// Current [`TerminationState`], advanced with
    /// a `max` compare-and-swap.
    termination: AtomicU8,

    /// Publishers currently awaiting a sequence range.
    publishers_waiting: AtomicUsize,

    /// Subscribers currently awaiting a published message.
    subscribers_waiting: AtomicUsize,
}

// Channel state may be sent between threads and accessed
// concurrently; slot access is guarded by the sequencing
// protocol documented on `slot` and `slot_mut`.
unsafe impl<T> Send for Shared<T> where T: Flows {}
unsafe impl<T> Sync for Shared<T> where T: Flows {}

impl<T> core::fmt::Debug for Shared<T>
where
    T: Flows,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("capacity", &self.buffer.len())
            .field(
                "termination",
                &TerminationState::from(self.termination.load(Ordering::SeqCst)),
            )
            .field("publishers_waiting", &self.publishers_waiting)
            .field("subscribers_waiting", &self.subscribers_waiting)
            .finish()
    }
}

impl<T: Flows> Channel<T> {
    /// # Panics
    ///
    /// Iff `capacity` is _not_ a power of two
    /// (like `2`, `32`, `256`, and so on).
    pub(crate) fn new(name: &str, capacity: usize, stride: usize) -> Self {
        assert!(
            capacity != 0 && capacity & (capacity - 1) == 0,
            "channel capacity _must_ be a power of two (like `2`, `4`, `256`, `2048`...), not {capacity}"
        );

        let mut buffer = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buffer.push(UnsafeCell::new(Envelope::default()));
        }

        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                sequencer: Sequencer::new(capacity, stride),
                buffer: buffer.into_boxed_slice(),
                termination: AtomicU8::new(TerminationState::Open as u8),
                publishers_waiting: AtomicUsize::new(0),
                subscribers_waiting: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    /// Maximum sequences a single claim may be granted.
    pub(crate) fn stride(&self) -> usize {
        self.shared.sequencer.stride() as usize
    }

    /// Sequence below which every message is published.
    pub(crate) fn cursor(&self) -> u64 {
        self.shared.sequencer.cursor()
    }

    /*******************************************************
     ****************** publish interface ******************
     ******************************************************/

    /// Requests permission to publish up to `limit` messages.
    ///
    /// Returns false once termination has started; pending
    /// waiters re-check the termination state on every poll,
    /// so a publisher parked here wakes and bows out as soon
    /// as a subscriber begins shutdown.
    pub(crate) async fn request_permission_to_publish(
        &self,
        token: &mut PublishToken<T>,
        limit: usize,
    ) -> bool {
        if self.termination_state() > TerminationState::Open {
            return false;
        }

        let _waiting = Waiting::begin(&self.shared.publishers_waiting);
        loop {
            if self.termination_state() > TerminationState::Open {
                return false;
            }

            if let Some(sequences) = self.shared.sequencer.try_claim(limit as u64) {
                token.sequences = Some(sequences);
                token.messages.clear();
                return true;
            }

            async_support::yield_now().await;
        }
    }

    /// Single-attempt claim for the shutdown drain.
    ///
    /// Skips the termination check: sentinels are published
    /// _after_ termination precisely to release subscribers
    /// still parked on the cursor.
    pub(crate) fn try_claim_for_drain(&self, token: &mut PublishToken<T>, limit: usize) -> bool {
        if let Some(sequences) = self.shared.sequencer.try_claim(limit as u64) {
            token.sequences = Some(sequences);
            token.messages.clear();
            return true;
        }
        false
    }

    /// Publishes the token's staged messages.
    ///
    /// Claimed sequences without a staged message are padded
    /// with terminal (sentinel) envelopes, so a claimed range
    /// is always published in full and the cursor never
    /// stalls behind a partial token.
    pub(crate) async fn publish_messages(&self, token: &mut PublishToken<T>) {
        let Some(sequences) = token.sequences.take() else {
            return;
        };
        debug_assert!(token.messages.len() <= (sequences.end - sequences.start) as usize);

        let mut next = sequences.start;
        while let Some(payload) = token.messages.pop_front() {
            // Claimed and unpublished: this driver has
            // exclusive access to the slot.
            unsafe {
                *self.shared.slot_mut(next) = Envelope {
                    payload,
                    sequence: next,
                    terminal: false,
                };
            }
            next += 1;
        }
        while next < sequences.end {
            unsafe {
                *self.shared.slot_mut(next) = Envelope {
                    payload: T::default(),
                    sequence: next,
                    terminal: true,
                };
            }
            next += 1;
        }

        // Wait for predecessors to land, then make the
        // range visible. Abandon a dead channel so a
        // stalled sibling publisher can't wedge shutdown.
        while !self.shared.sequencer.try_publish(sequences.clone()) {
            if self.termination_state() == TerminationState::Drained {
                return;
            }
            async_support::yield_now().await;
        }
    }

    /// Stops claiming new work on behalf of the
    /// publisher side.
    pub(crate) fn confirm_termination(&self) {
        self.advance_termination(TerminationState::ShutdownConfirmed);
    }

    pub(crate) fn publishers_waiting(&self) -> usize {
        self.shared.publishers_waiting.load(Ordering::SeqCst)
    }

    /*******************************************************
     ***************** subscribe interface *****************
     ******************************************************/

    /// Registers a new subscriber, starting at the
    /// current cursor.
    pub(crate) fn add_subscriber(&self) -> SubscriberToken<T> {
        let barrier = self.shared.sequencer.add_barrier();
        let position = barrier.position();
        SubscriberToken {
            barrier,
            next_to_read: position,
            end_of_batch: 0,
            last_ack: position.saturating_sub(1),
            _message: PhantomData,
        }
    }

    /// Waits until at least one message past the token's
    /// read position is published, then records the batch
    /// bounds in the token.
    ///
    /// Returns false iff `interrupt` fired first.
    pub(crate) async fn next_batch(
        &self,
        token: &mut SubscriberToken<T>,
        interrupt: impl Fn() -> bool,
    ) -> bool {
        let _waiting = Waiting::begin(&self.shared.subscribers_waiting);
        loop {
            let published = self.cursor();
            if token.next_to_read < published {
                token.end_of_batch = published - 1;
                return true;
            }

            if interrupt() {
                return false;
            }

            async_support::yield_now().await;
        }
    }

    /// Returns a copy of the message at `sequence`.
    ///
    /// `sequence` must be published and not yet passed by
    /// this subscriber's barrier, which is guaranteed for
    /// everything inside the batch bounds of a token.
    pub(crate) fn read(&self, sequence: u64) -> Envelope<T> {
        debug_assert!(sequence < self.cursor());

        // Published and unconsumed: no publisher may
        // reclaim this slot while the barrier is behind it.
        unsafe { (*self.shared.slot(sequence)).clone() }
    }

    /// Acknowledges everything read so far, releasing the
    /// slots for publishers to reuse.
    pub(crate) fn notify_message_consumed(&self, token: &mut SubscriberToken<T>) {
        if token.next_to_read == 0 {
            return;
        }

        let consumed = token.next_to_read - 1;
        token.barrier.advance_to(consumed);
        token.last_ack = consumed;
    }

    /// Starts the shutdown protocol on behalf of the
    /// subscriber side.
    pub(crate) fn initialize_termination(&self) {
        self.advance_termination(TerminationState::ShutdownStarted);
    }

    /// Marks the subscriber side fully drained.
    pub(crate) fn finalize_termination(&self) {
        self.advance_termination(TerminationState::Drained);
    }

    pub(crate) fn subscribers_waiting(&self) -> usize {
        self.shared.subscribers_waiting.load(Ordering::SeqCst)
    }

    /*******************************************************
     ********************* termination *********************
     ******************************************************/

    pub(crate) fn termination_state(&self) -> TerminationState {
        self.shared.termination.load(Ordering::SeqCst).into()
    }

    fn advance_termination(&self, target: TerminationState) {
        self.shared
            .termination
            .fetch_max(target as u8, Ordering::SeqCst);
    }
}

impl<T: Flows> Shared<T> {
    /// Returns a pointer to the slot of `sequence`,
    /// for reading.
    ///
    /// # Safety
    ///
    /// The sequence must be published (below the cursor)
    /// and unconsumed (at or above every barrier), so no
    /// publisher holds write access to the slot while the
    /// caller dereferences it.
    #[inline(always)]
    unsafe fn slot(&self, sequence: u64) -> *const Envelope<T> {
        let index = (self.buffer.len() - 1) & sequence as usize;

        // Masked access is always within bounds.
        self.buffer.get_unchecked(index).get()
    }

    /// Returns a pointer to the slot of `sequence`,
    /// for writing.
    ///
    /// # Safety
    ///
    /// The caller must have claimed `sequence` and not yet
    /// published it. In that window the claimant is the only
    /// task with any access to the slot: subscribers can't
    /// see it (it's at or above the cursor) and no other
    /// publisher holds it (claims are disjoint).
    #[inline(always)]
    unsafe fn slot_mut(&self, sequence: u64) -> *mut Envelope<T> {
        let index = (self.buffer.len() - 1) & sequence as usize;

        // Masked access is always within bounds.
        self.buffer.get_unchecked(index).get()
    }
}

/// Drop guard over a waiting counter.
struct Waiting<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> Waiting<'a> {
    fn begin(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
