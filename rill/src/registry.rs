//! Lazily-created channels, keyed by message type and name.
//!
//! The registry is how independently-pushed routines find each
//! other: the first routine to mention `(T, "name")` creates the
//! channel, everyone after it gets a clone of the same ring.
//! Because the message type is part of the key, a name may be
//! reused across types without collision, and the typed downcast
//! on lookup is correct by construction.

use core::any::{Any, TypeId};
use std::collections::HashMap;

use parking_lot::Mutex;
use snafu::ensure;

use crate::{channel::Channel, Error, Flows, Options, RegistryFullSnafu};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    message: TypeId,
    name: String,
}

impl ChannelKey {
    fn of<T: Flows>(name: &str) -> Self {
        Self {
            message: TypeId::of::<T>(),
            name: name.to_owned(),
        }
    }
}

/// The channels of one network.
pub(crate) struct Registry {
    max_resources: usize,
    message_buffer_size: usize,
    stride_length: usize,
    channels: Mutex<HashMap<ChannelKey, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    pub(crate) fn new(options: &Options) -> Self {
        Self {
            max_resources: options.max_resources,
            message_buffer_size: options.message_buffer_size,
            stride_length: options.stride_length,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn contains<T: Flows>(&self, name: &str) -> bool {
        self.channels.lock().contains_key(&ChannelKey::of::<T>(name))
    }

    pub(crate) fn get<T: Flows>(&self, name: &str) -> Option<Channel<T>> {
        self.channels
            .lock()
            .get(&ChannelKey::of::<T>(name))
            .map(|entry| downcast::<T>(entry.as_ref()))
    }

    /// Returns the channel for `(T, name)`, creating it on
    /// first reference.
    pub(crate) fn get_or_create<T: Flows>(&self, name: &str) -> Result<Channel<T>, Error> {
        if let Some(existing) = self.get::<T>(name) {
            return Ok(existing);
        }

        let key = ChannelKey::of::<T>(name);
        let mut channels = self.channels.lock();

        ensure!(
            channels.len() < self.max_resources,
            RegistryFullSnafu {
                limit: self.max_resources
            }
        );

        let channel = Channel::<T>::new(name, self.message_buffer_size, self.stride_length);
        log::debug!("created channel `{name}` (capacity {})", self.message_buffer_size);
        channels.insert(key, Box::new(channel.clone()));
        Ok(channel)
    }
}

fn downcast<T: Flows>(entry: &(dyn Any + Send + Sync)) -> Channel<T> {
    // The key encodes the message type, so the entry
    // is always a `Channel<T>`.
    entry
        .downcast_ref::<Channel<T>>()
        .expect("registry key and channel type always agree")
        .clone()
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry() -> Registry {
        Registry::new(&Options::default().with_max_resources(2))
    }

    #[test]
    fn creates_on_first_reference() {
        let registry = registry();

        assert!(!registry.contains::<u32>("numbers"));
        assert!(registry.get::<u32>("numbers").is_none());

        let channel = registry.get_or_create::<u32>("numbers").unwrap();
        assert!(registry.contains::<u32>("numbers"));
        assert_eq!("numbers", channel.name());
    }

    #[test]
    fn lookups_share_one_ring() {
        let registry = registry();

        let first = registry.get_or_create::<String>("words").unwrap();
        let second = registry.get_or_create::<String>("words").unwrap();

        first.initialize_termination();
        assert_eq!(
            first.termination_state(),
            second.termination_state(),
            "both lookups must observe the same channel state"
        );
    }

    #[test]
    fn names_are_scoped_by_message_type() {
        let registry = registry();

        registry.get_or_create::<u32>("data").unwrap();
        assert!(!registry.contains::<String>("data"));

        // A second type under the same name is a
        // distinct channel, not a conflict.
        registry.get_or_create::<String>("data").unwrap();
        assert!(registry.contains::<u32>("data"));
        assert!(registry.contains::<String>("data"));
    }

    #[test]
    fn overflows_past_max_resources() {
        let registry = registry();

        registry.get_or_create::<u32>("one").unwrap();
        registry.get_or_create::<u32>("two").unwrap();

        let overflow = registry.get_or_create::<u32>("three");
        assert_eq!(Some(Error::RegistryFull { limit: 2 }), overflow.err());

        // Existing channels are still reachable.
        assert!(registry.get_or_create::<u32>("one").is_ok());
    }
}
