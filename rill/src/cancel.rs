//! Cancellable callables and their handles.
//!
//! Any user function pushed into a network is wrapped in a
//! [`Cancellable`], which pairs the function with a shared
//! cancellation flag. A [`CancellationHandle`] points at the
//! same flag and may be copied freely; requesting cancellation
//! through any copy notifies the routine that it should stop
//! the next time it checks.
//!
//! Cancellation is advisory: nothing prevents the wrapped
//! function from being invoked again, but the drivers check
//! the flag at every suspension point and begin their shutdown
//! protocol once it is set.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle over a [`Cancellable`]'s shared cancellation flag.
///
/// Handles are cheap to clone and safe to share across
/// threads; requesting cancellation is idempotent.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Requests cancellation of the routine this
    /// handle was taken from.
    pub fn request_cancellation(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true iff cancellation has been requested.
    pub fn is_cancellation_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A user callable paired with a cancellation flag.
#[derive(Debug)]
pub(crate) struct Cancellable<F> {
    /// The wrapped user function. Drivers invoke
    /// it directly.
    pub(crate) callback: F,

    flag: Arc<AtomicBool>,
}

impl<F> Cancellable<F> {
    pub(crate) fn new(callback: F) -> Self {
        Self {
            callback,
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a new handle over this callable's
    /// cancellation flag.
    pub(crate) fn handle(&self) -> CancellationHandle {
        CancellationHandle {
            flag: self.flag.clone(),
        }
    }

    /// Returns true iff any handle requested cancellation.
    pub(crate) fn is_cancellation_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handles_share_one_flag() {
        let cancellable = Cancellable::new(|| 42);
        let first = cancellable.handle();
        let second = first.clone();

        assert!(!cancellable.is_cancellation_requested());
        assert!(!first.is_cancellation_requested());

        second.request_cancellation();

        assert!(cancellable.is_cancellation_requested());
        assert!(first.is_cancellation_requested());
        assert!(second.is_cancellation_requested());
    }

    #[test]
    fn cancellation_is_idempotent() {
        let cancellable = Cancellable::new(|| ());
        let handle = cancellable.handle();

        handle.request_cancellation();
        handle.request_cancellation();
        handle.request_cancellation();

        assert!(cancellable.is_cancellation_requested());
    }

    #[test]
    fn callback_still_invocable_after_cancellation() {
        let mut cancellable = Cancellable::new(|x: u32| x + 1);
        cancellable.handle().request_cancellation();

        // Advisory only: the function itself keeps working.
        assert_eq!(5, (cancellable.callback)(4));
    }
}
