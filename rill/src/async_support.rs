//! Runtime-agnostic `async` utilities.
//!
//! Every wait in this crate is a cooperative re-poll:
//! a driver that can't make progress wakes itself and
//! yields the worker back to the scheduler instead of
//! blocking it. [`yield_now`] is that hop.

use core::{
    any::Any,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Returns a future that becomes ready
/// after one poll, emulating a yield on
/// most async runtimes.
pub async fn yield_now() {
    YieldNow::Pending.await
}

/// Future returned by [`yield_now`].
enum YieldNow {
    /// The future has not yet yielded.
    Pending,

    /// The future has yielded for
    /// at least one poll cycle, and
    /// is now ready.
    Ready,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match *self {
            YieldNow::Pending => {
                *self = YieldNow::Ready;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            YieldNow::Ready => Poll::Ready(()),
        }
    }
}

/// Future adapter that resolves to an `Err` holding the
/// panic payload when the wrapped future's poll unwinds.
///
/// This implementation is based on the
/// [`futures` crate](https://github.com/rust-lang/futures-rs),
/// and may be removed in the future.
pub(crate) struct CatchUnwind<F: Future> {
    future: Pin<Box<F>>,
}

impl<F: Future> CatchUnwind<F> {
    pub(crate) fn new(future: F) -> Self {
        Self {
            future: Box::pin(future),
        }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match catch_unwind(AssertUnwindSafe(|| this.future.as_mut().poll(cx))) {
            Ok(poll) => poll.map(Ok),
            Err(panic) => Poll::Ready(Err(panic)),
        }
    }
}
