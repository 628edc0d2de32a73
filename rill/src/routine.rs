//! The four routine kinds and their constructors.
//!
//! A routine is a user function plus the channel name(s) it
//! communicates through, wrapped with a cancellation source.
//! Routines are inert values until they are pushed into a
//! [`Network`](crate::Network), which wires them to channels
//! and hands them to their drivers.

use crate::{cancel::Cancellable, CancellationHandle, Flows, Frequency};

pub(crate) type PublisherFn<T> = Box<dyn FnMut() -> T + Send + Sync>;
pub(crate) type SubscriberFn<T> = Box<dyn FnMut(T) + Send + Sync>;
pub(crate) type TransformerFn<A, B> = Box<dyn FnMut(A) -> B + Send + Sync>;
pub(crate) type SpinnerFn = Box<dyn FnMut() + Send + Sync>;

/// A routine producing one `T` per invocation.
pub struct Publisher<T: Flows> {
    pub(crate) callback: Cancellable<PublisherFn<T>>,
    pub(crate) channel: String,
    pub(crate) frequency: Option<Frequency>,
}

/// Creates a publisher from a callback and the channel
/// name to publish on.
pub fn publisher<T, F>(callback: F, publish_to: impl Into<String>) -> Publisher<T>
where
    T: Flows,
    F: FnMut() -> T + Send + Sync + 'static,
{
    Publisher {
        callback: Cancellable::new(Box::new(callback)),
        channel: publish_to.into(),
        frequency: None,
    }
}

impl<T: Flows> Publisher<T> {
    /// Name of the channel this publisher publishes to.
    pub fn publish_to(&self) -> &str {
        &self.channel
    }

    /// Caps this publisher at `frequency` invocations
    /// per second.
    pub fn at(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn handle(&self) -> CancellationHandle {
        self.callback.handle()
    }
}

/// A routine consuming one `T` per invocation.
pub struct Subscriber<T: Flows> {
    pub(crate) callback: Cancellable<SubscriberFn<T>>,
    pub(crate) channel: String,
}

/// Creates a subscriber from a callback and the channel
/// name to subscribe to.
pub fn subscriber<T, F>(callback: F, subscribe_to: impl Into<String>) -> Subscriber<T>
where
    T: Flows,
    F: FnMut(T) + Send + Sync + 'static,
{
    Subscriber {
        callback: Cancellable::new(Box::new(callback)),
        channel: subscribe_to.into(),
    }
}

impl<T: Flows> Subscriber<T> {
    /// Name of the channel this subscriber subscribes to.
    pub fn subscribe_to(&self) -> &str {
        &self.channel
    }

    pub fn handle(&self) -> CancellationHandle {
        self.callback.handle()
    }
}

/// A routine consuming an `A` and producing a `B`.
pub struct Transformer<A: Flows, B: Flows> {
    pub(crate) callback: Cancellable<TransformerFn<A, B>>,
    pub(crate) input: String,
    pub(crate) output: String,
}

/// Creates a transformer from a callback, the channel name
/// it consumes from, and the channel name it publishes to.
pub fn transformer<A, B, F>(
    callback: F,
    subscribe_to: impl Into<String>,
    publish_to: impl Into<String>,
) -> Transformer<A, B>
where
    A: Flows,
    B: Flows,
    F: FnMut(A) -> B + Send + Sync + 'static,
{
    Transformer {
        callback: Cancellable::new(Box::new(callback)),
        input: subscribe_to.into(),
        output: publish_to.into(),
    }
}

impl<A: Flows, B: Flows> Transformer<A, B> {
    /// Name of the channel this transformer consumes from.
    pub fn subscribe_to(&self) -> &str {
        &self.input
    }

    /// Name of the channel this transformer publishes to.
    pub fn publish_to(&self) -> &str {
        &self.output
    }

    pub fn handle(&self) -> CancellationHandle {
        self.callback.handle()
    }
}

/// A self-contained looping routine with no channel I/O.
pub struct Spinner {
    pub(crate) callback: Cancellable<SpinnerFn>,
}

/// Creates a spinner from a callback.
pub fn spinner<F>(callback: F) -> Spinner
where
    F: FnMut() + Send + Sync + 'static,
{
    Spinner {
        callback: Cancellable::new(Box::new(callback)),
    }
}

impl Spinner {
    pub fn handle(&self) -> CancellationHandle {
        self.callback.handle()
    }
}
