//! Typestate pipeline builder.
//!
//! A [`Chain`] accumulates routines left to right with the
//! `|` operator or with the closure-lifting methods, and its
//! type parameter tracks where in a pipeline it is:
//!
//! * [`Init`]: empty. Accepts a publisher (or a transformer
//!   bridging in from a named channel), which opens it, or a
//!   spinner, which closes it.
//! * [`Open<T>`]: mid-pipeline, currently carrying `T`.
//!   Accepts transformers of `T`, staying open, or a
//!   subscriber of `T`, which closes it.
//! * [`Closed`]: complete.
//!
//! Anything else (two publishers, a subscriber of the wrong
//! type, appending to a closed chain) is a compile error,
//! not a runtime one.
//!
//! Channel names are resolved when a routine is appended:
//! routines built with the explicit constructors keep their
//! names (a shared name is how two chains bridge), while
//! closures lifted by [`Chain::publish`]/[`Chain::transform`]/
//! [`Chain::subscribe`] are wired together through anonymous
//! channels no other chain can collide with.

use core::{
    marker::PhantomData,
    ops::BitOr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    net::{Network, Routines},
    publisher, spinner, subscriber, transformer, Error, Flows, Frequency, Publisher, Spinner,
    Subscriber, Transformer,
};

/// State of an empty [`Chain`].
pub struct Init;

/// State of a [`Chain`] whose last routine publishes `T`.
pub struct Open<T>(PhantomData<T>);

/// State of a completed [`Chain`].
pub struct Closed;

type Link = Box<dyn FnOnce(&mut Network) -> Result<(), Error> + Send>;

/// A pipeline under construction.
///
/// See the [module docs](self) for the accepted transitions.
pub struct Chain<State> {
    frequency: Option<Frequency>,
    links: Vec<Link>,
    tail: Option<String>,
    state: PhantomData<State>,
}

/// Starts an empty, best-effort chain.
pub fn chain() -> Chain<Init> {
    Chain {
        frequency: None,
        links: Vec::new(),
        tail: None,
        state: PhantomData,
    }
}

/// Starts an empty chain whose publisher will be paced
/// at `frequency`.
pub fn chain_at(frequency: Frequency) -> Chain<Init> {
    Chain {
        frequency: Some(frequency),
        links: Vec::new(),
        tail: None,
        state: PhantomData,
    }
}

impl<State> Chain<State> {
    /// Moves this chain's accumulated routines into a
    /// differently-tagged chain.
    fn transition<Next>(self, tail: Option<String>) -> Chain<Next> {
        Chain {
            frequency: self.frequency,
            links: self.links,
            tail,
            state: PhantomData,
        }
    }

    /// Pushes every accumulated routine into `network`,
    /// in pipeline order.
    pub(crate) fn attach_links(self, network: &mut Network) -> Result<(), Error> {
        for link in self.links {
            link(network)?;
        }
        Ok(())
    }
}

impl Chain<Init> {
    /// Opens the chain with `callback` as its publisher,
    /// publishing to an anonymous channel.
    pub fn publish<T, F>(self, callback: F) -> Chain<Open<T>>
    where
        T: Flows,
        F: FnMut() -> T + Send + Sync + 'static,
    {
        self | publisher(callback, anonymous_channel())
    }

    /// Closes the chain with `callback` as a spinner.
    pub fn spin<F>(self, callback: F) -> Chain<Closed>
    where
        F: FnMut() + Send + Sync + 'static,
    {
        self | spinner(callback)
    }
}

impl<A: Flows> Chain<Open<A>> {
    /// Appends `callback` as a transformer, reading from the
    /// chain's tail channel and publishing to an anonymous one.
    pub fn transform<B, F>(self, callback: F) -> Chain<Open<B>>
    where
        B: Flows,
        F: FnMut(A) -> B + Send + Sync + 'static,
    {
        let input = self.tail.clone().expect("an open chain always has a tail channel");
        self | transformer(callback, input, anonymous_channel())
    }

    /// Closes the chain with `callback` as its subscriber,
    /// reading from the chain's tail channel.
    pub fn subscribe<F>(self, callback: F) -> Chain<Closed>
    where
        F: FnMut(A) + Send + Sync + 'static,
    {
        let input = self.tail.clone().expect("an open chain always has a tail channel");
        self | subscriber(callback, input)
    }
}

impl<T: Flows> BitOr<Publisher<T>> for Chain<Init> {
    type Output = Chain<Open<T>>;

    fn bitor(mut self, mut routine: Publisher<T>) -> Chain<Open<T>> {
        // The chain's frequency paces its originator, unless
        // the publisher already carries its own.
        routine.frequency = routine.frequency.or(self.frequency);
        let tail = routine.publish_to().to_owned();
        self.links
            .push(Box::new(move |network| network.push(routine)));
        self.transition(Some(tail))
    }
}

impl<A: Flows, B: Flows> BitOr<Transformer<A, B>> for Chain<Init> {
    type Output = Chain<Open<B>>;

    fn bitor(mut self, routine: Transformer<A, B>) -> Chain<Open<B>> {
        let tail = routine.publish_to().to_owned();
        self.links
            .push(Box::new(move |network| network.push(routine)));
        self.transition(Some(tail))
    }
}

impl BitOr<Spinner> for Chain<Init> {
    type Output = Chain<Closed>;

    fn bitor(mut self, routine: Spinner) -> Chain<Closed> {
        self.links
            .push(Box::new(move |network| network.push(routine)));
        self.transition(None)
    }
}

impl<A: Flows, B: Flows> BitOr<Transformer<A, B>> for Chain<Open<A>> {
    type Output = Chain<Open<B>>;

    fn bitor(mut self, routine: Transformer<A, B>) -> Chain<Open<B>> {
        let tail = routine.publish_to().to_owned();
        self.links
            .push(Box::new(move |network| network.push(routine)));
        self.transition(Some(tail))
    }
}

impl<A: Flows> BitOr<Subscriber<A>> for Chain<Open<A>> {
    type Output = Chain<Closed>;

    fn bitor(mut self, routine: Subscriber<A>) -> Chain<Closed> {
        self.links
            .push(Box::new(move |network| network.push(routine)));
        self.transition(None)
    }
}

impl Routines for Chain<Closed> {
    fn attach(self, network: &mut Network) -> Result<(), Error> {
        self.attach_links(network)
    }
}

/// An open chain may be pushed as-is: its tail channel
/// simply has no consumer in this chain, which is how a
/// publisher-only chain feeds pipelines that bridge in
/// by name.
impl<T: Flows> Routines for Chain<Open<T>> {
    fn attach(self, network: &mut Network) -> Result<(), Error> {
        self.attach_links(network)
    }
}

fn anonymous_channel() -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("#anon/{}", NEXT.fetch_add(1, Ordering::Relaxed))
}
