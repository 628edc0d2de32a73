// Use the README file as the root-level
// docs for this library.
#![doc = include_str!("../README.md")]

use snafu::Snafu;

pub mod async_support;
pub mod cancel;
pub mod chain;
mod channel;
mod driver;
pub mod net;
pub mod pacer;
mod registry;
pub mod routine;
mod seq;

pub use cancel::CancellationHandle;
pub use chain::{chain, chain_at, Chain, Closed, Init, Open};
pub use net::{network, Network, NetworkHandle, Routines};
pub use pacer::{frequency, Frequency};
pub use routine::{
    publisher, spinner, subscriber, transformer, Publisher, Spinner, Subscriber, Transformer,
};

/// Blanket trait for messages in a channel.
///
/// Messages are cloned out of the ring when delivered
/// (so multiple subscribers can receive the same data),
/// and default-constructed to pre-fill ring slots and
/// to pad drained sequence ranges during shutdown.
pub trait Flows: Clone + Default + Send + Sync + 'static {}
impl<T> Flows for T where T: Clone + Default + Send + Sync + 'static {}

/// Configuration recognized by a [`Network`].
///
/// ```
/// use rill::{frequency, Options};
///
/// let options = Options::default()
///     .with_message_buffer_size(256)
///     .with_frequency(frequency(100.0));
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Ring capacity of every channel, in messages.
    /// _Must_ be a power of two.
    pub message_buffer_size: usize,

    /// Maximum number of distinct channels the
    /// network's registry may serve.
    pub max_resources: usize,

    /// Maximum number of sequences a publisher may
    /// claim in one request.
    pub stride_length: usize,

    /// Default publishing rate for publishers that
    /// don't carry their own. `None` is best-effort.
    pub frequency: Option<Frequency>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            message_buffer_size: 1024,
            max_resources: 1024,
            stride_length: 16,
            frequency: None,
        }
    }
}

impl Options {
    pub fn with_message_buffer_size(mut self, messages: usize) -> Self {
        self.message_buffer_size = messages;
        self
    }

    pub fn with_max_resources(mut self, channels: usize) -> Self {
        self.max_resources = channels;
        self
    }

    pub fn with_stride_length(mut self, sequences: usize) -> Self {
        self.stride_length = sequences;
        self
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }
}

/// Enumeration of non-retryable errors
/// that may happen while assembling or
/// spinning a network.
///
/// Back-pressure and shutdown signals are
/// not errors: the drivers recover from
/// those internally, and no in-flight
/// message is lost to them.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// More channels were requested than
    /// [`Options::max_resources`] allows.
    #[snafu(display("channel registry is full ({limit} channels)"))]
    RegistryFull { limit: usize },

    /// A user callback panicked inside its driver.
    /// The panic cancelled the whole network, which
    /// drained and shut down before surfacing this.
    #[snafu(display("routine `{routine}` panicked"))]
    RoutinePanicked { routine: String },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_options() {
        let options = Options::default();
        assert_eq!(1024, options.message_buffer_size);
        assert_eq!(1024, options.max_resources);
        assert_eq!(16, options.stride_length);
        assert_eq!(None, options.frequency);
    }

    #[test]
    fn options_builder() {
        let options = Options::default()
            .with_message_buffer_size(64)
            .with_max_resources(8)
            .with_stride_length(4)
            .with_frequency(frequency(50.0));

        assert_eq!(64, options.message_buffer_size);
        assert_eq!(8, options.max_resources);
        assert_eq!(4, options.stride_length);
        assert_eq!(Some(frequency(50.0)), options.frequency);
    }
}
