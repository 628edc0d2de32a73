//! Network assembly and execution.
//!
//! A [`Network`] owns everything a set of pipelines needs to
//! run: the scheduler (a work-stealing tokio runtime), the
//! channel registry, the driver task for every pushed routine,
//! and a fan-out [`NetworkHandle`] that requests cancellation
//! on all of them at once.
//!
//! Cancellation starts at the consuming end: the handle flips
//! the flags of every subscriber and spinner, and the channel
//! termination protocol carries the shutdown backwards to the
//! publishers. `spin` returns once every driver has exited on
//! its own; no task is ever killed.

use core::{any::Any, future::Future, pin::Pin, time::Duration};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    async_support::CatchUnwind,
    cancel::CancellationHandle,
    driver,
    pacer::Pacer,
    registry::Registry,
    routine::{Publisher, Spinner, Subscriber, Transformer},
    Error, Flows, Options,
};

/// Things a [`Network`] accepts in [`Network::push`]: the
/// four routine kinds, and chains of them.
pub trait Routines {
    /// Wires this routine (or chain of routines) into
    /// `network`'s channels and drivers.
    fn attach(self, network: &mut Network) -> Result<(), Error>;
}

/// Fan-out cancellation handle over every cancellable
/// routine of one network.
///
/// Cheap to clone and safe to use from any thread, inside
/// or outside the network. Requesting cancellation is
/// idempotent.
#[derive(Debug, Clone, Default)]
pub struct NetworkHandle {
    handles: Arc<Mutex<Vec<CancellationHandle>>>,
}

impl NetworkHandle {
    /// Requests cancellation of every subscriber and
    /// spinner in the network, which begins the drain
    /// protocol described in the [module docs](self).
    pub fn request_cancellation(&self) {
        for handle in self.handles.lock().iter() {
            handle.request_cancellation();
        }
    }

    pub(crate) fn push(&self, handle: CancellationHandle) {
        self.handles.lock().push(handle);
    }
}

/// A driver task waiting for [`Network::spin`].
struct Task {
    routine: String,
    future: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// A set of routines wired together by channels, ready
/// to run on a shared pool.
pub struct Network {
    options: Options,
    runtime: tokio::runtime::Runtime,
    registry: Registry,
    tasks: Vec<Task>,
    handle: NetworkHandle,
    cancellations: Vec<Duration>,
}

/// Creates an empty network with default [`Options`].
pub fn network() -> Network {
    Network::new()
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    /// # Panics
    ///
    /// Iff the scheduler's worker threads cannot be spawned.
    pub fn with_options(options: Options) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_time()
            .build()
            .expect("the network scheduler failed to start");

        Self {
            registry: Registry::new(&options),
            options,
            runtime,
            tasks: Vec::new(),
            handle: NetworkHandle::default(),
            cancellations: Vec::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Returns the fan-out cancellation handle for this
    /// network.
    pub fn handle(&self) -> NetworkHandle {
        self.handle.clone()
    }

    /// Pushes a routine, or a chain of routines, into the
    /// network, creating any channels it names that don't
    /// exist yet.
    pub fn push(&mut self, routines: impl Routines) -> Result<(), Error> {
        routines.attach(self)
    }

    /// Schedules a cancellation request `timeout` after
    /// [`Self::spin`] starts.
    ///
    /// This does not mean the network stops after `timeout`:
    /// shutdown takes a non-deterministic amount of time to
    /// drain every channel cleanly.
    pub fn cancel_after(&mut self, timeout: Duration) {
        self.cancellations.push(timeout);
    }

    /// Number of routines pushed so far.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawns every driver and waits for all of them to
    /// complete.
    ///
    /// A panicking user callback cancels the whole network;
    /// the remaining drivers drain and exit cleanly, and the
    /// panic surfaces as [`Error::RoutinePanicked`].
    pub fn spin(mut self) -> Result<(), Error> {
        log::debug!("spinning network: {} routines", self.tasks.len());

        for timeout in self.cancellations.drain(..) {
            let handle = self.handle.clone();
            self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                log::debug!("cancellation timer fired after {timeout:?}");
                handle.request_cancellation();
            });
        }

        let panicked: Arc<Mutex<Vec<String>>> = Arc::default();
        let mut spinning = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            let routine = task.routine;
            let handle = self.handle.clone();
            let panicked = panicked.clone();

            spinning.push(self.runtime.spawn(async move {
                if let Err(panic) = CatchUnwind::new(task.future).await {
                    // Cancel immediately so the rest of the
                    // network unwinds instead of waiting on a
                    // driver that will never come back.
                    log::error!(
                        "routine `{routine}` panicked: {}; cancelling the network",
                        panic_message(panic.as_ref())
                    );
                    handle.request_cancellation();
                    panicked.lock().push(routine);
                }
            }));
        }

        for task in spinning {
            // The wrapper task neither panics nor gets
            // aborted; join errors are impossible here.
            let _ = self.runtime.block_on(task);
        }

        let panicked = panicked.lock().first().cloned();
        match panicked {
            Some(routine) => Err(Error::RoutinePanicked { routine }),
            None => Ok(()),
        }
    }
}

impl<T: Flows> Routines for Publisher<T> {
    fn attach(self, network: &mut Network) -> Result<(), Error> {
        let channel = network.registry.get_or_create::<T>(&self.channel)?;
        let pacer = Pacer::new(self.frequency.or(network.options.frequency));

        network.tasks.push(Task {
            routine: format!("publisher({})", self.channel),
            future: Box::pin(driver::spin_publisher(channel, self.callback, pacer)),
        });
        Ok(())
    }
}

impl<T: Flows> Routines for Subscriber<T> {
    fn attach(self, network: &mut Network) -> Result<(), Error> {
        let channel = network.registry.get_or_create::<T>(&self.channel)?;

        // Register before anything runs, so not even the
        // first published message slips past this subscriber.
        let token = channel.add_subscriber();
        network.handle.push(self.callback.handle());

        network.tasks.push(Task {
            routine: format!("subscriber({})", self.channel),
            future: Box::pin(driver::spin_subscriber(channel, self.callback, token)),
        });
        Ok(())
    }
}

impl<A: Flows, B: Flows> Routines for Transformer<A, B> {
    fn attach(self, network: &mut Network) -> Result<(), Error> {
        let upstream = network.registry.get_or_create::<A>(&self.input)?;
        let downstream = network.registry.get_or_create::<B>(&self.output)?;
        let token = upstream.add_subscriber();

        network.tasks.push(Task {
            routine: format!("transformer({} -> {})", self.input, self.output),
            future: Box::pin(driver::spin_transformer(
                upstream,
                downstream,
                self.callback,
                token,
            )),
        });
        Ok(())
    }
}

impl Routines for Spinner {
    fn attach(self, network: &mut Network) -> Result<(), Error> {
        network.handle.push(self.callback.handle());

        network.tasks.push(Task {
            routine: "spinner".to_owned(),
            future: Box::pin(driver::spin_spinner(self.callback)),
        });
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{chain, publisher, spinner, subscriber};

    #[test]
    fn pushing_routines_grows_the_network() {
        let mut net = network();
        assert!(net.is_empty());

        net.push(publisher(|| 1_u32, "numbers")).unwrap();
        net.push(subscriber(|_: u32| (), "numbers")).unwrap();
        assert_eq!(2, net.len());
    }

    #[test]
    fn handle_cancels_before_spin() {
        let mut net = network();
        net.push(spinner(|| ())).unwrap();
        net.push(spinner(|| ())).unwrap();

        // Cancelling up front means spin only has to
        // observe the flags and wind down.
        net.handle().request_cancellation();
        net.spin().unwrap();
    }

    #[test]
    fn registry_overflow_surfaces_from_push() {
        let mut net = Network::with_options(Options::default().with_max_resources(1));

        net.push(publisher(|| 1_u32, "one")).unwrap();
        let overflow = net.push(publisher(|| 2_u32, "two"));
        assert_eq!(Err(Error::RegistryFull { limit: 1 }), overflow);
    }

    #[test]
    fn panicking_subscribers_abort_the_network() {
        let mut net = network();
        net.push(
            chain()
                .publish(|| 1_u32)
                .subscribe(|_: u32| panic!("subscriber fell over")),
        )
        .unwrap();

        let error = net.spin().unwrap_err();
        assert!(matches!(error, Error::RoutinePanicked { .. }));
    }

    #[test]
    fn spinners_spin_until_cancelled() {
        let spins = Arc::new(AtomicU64::new(0));
        let counter = spins.clone();

        let mut net = network();
        net.push(spinner(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        net.cancel_after(Duration::from_millis(10));
        net.spin().unwrap();

        assert!(spins.load(Ordering::SeqCst) > 0);
    }
}
