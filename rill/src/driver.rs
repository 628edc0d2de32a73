//! The driver loops that spin each routine kind.
//!
//! Every driver is one async task on the network's pool. The
//! loops are the only callers of channel operations, and they
//! implement the cooperative shutdown protocol end to end:
//!
//! 1. A subscriber observes cancellation, stops taking new
//!    batches, and starts termination on its channel.
//! 2. Publishers on that channel notice, stop claiming fresh
//!    sequences, and confirm termination.
//! 3. The subscriber drains every message already published
//!    (so nothing in flight is lost), then finalizes.
//! 4. Publishers release any subscriber still parked on the
//!    cursor by publishing terminal sentinel envelopes, which
//!    are never delivered to user callbacks.
//!
//! Transformers play the publisher role on their output
//! channel first, then the subscriber role on their input
//! channel, which is how termination trickles backwards
//! through a pipeline.

use crate::{
    async_support,
    cancel::Cancellable,
    channel::{Channel, PublishToken, SubscriberToken, TerminationState},
    pacer::Pacer,
    routine::{PublisherFn, SpinnerFn, SubscriberFn, TransformerFn},
    Flows,
};

/// Spins `publisher`, publishing one message per granted
/// sequence, until its channel begins termination.
pub(crate) async fn spin_publisher<T: Flows>(
    channel: Channel<T>,
    mut publisher: Cancellable<PublisherFn<T>>,
    mut pacer: Pacer,
) {
    let _cleanup = PanicCleanup::new(|| {
        channel.confirm_termination();
        channel.finalize_termination();
    });

    let mut token = PublishToken::default();

    // A paced publisher claims one sequence per tick;
    // a free-running one batches up to the stride.
    let limit = if pacer.is_paced() { 1 } else { channel.stride() };

    log::debug!("publisher on `{}`: spinning", channel.name());

    loop {
        // One scheduler hop per iteration keeps a
        // free-running publisher from pinning a worker.
        async_support::yield_now().await;
        pacer
            .tick(|| channel.termination_state() >= TerminationState::ShutdownStarted)
            .await;

        if channel.termination_state() >= TerminationState::ShutdownStarted {
            break;
        }

        if !channel.request_permission_to_publish(&mut token, limit).await {
            break;
        }

        for _ in 0..token.claimed() {
            token.stage((publisher.callback)());
        }

        channel.publish_messages(&mut token).await;
    }

    log::debug!("publisher on `{}`: confirming termination", channel.name());
    channel.confirm_termination();
    release_waiting_subscribers(&channel).await;
}

/// Spins `subscriber`, delivering every published message,
/// until cancellation is requested or the channel begins
/// termination; then drains and finalizes.
pub(crate) async fn spin_subscriber<T: Flows>(
    channel: Channel<T>,
    mut subscriber: Cancellable<SubscriberFn<T>>,
    mut token: SubscriberToken<T>,
) {
    let _cleanup = PanicCleanup::new(|| {
        channel.initialize_termination();
        channel.finalize_termination();
    });

    log::debug!("subscriber on `{}`: spinning", channel.name());

    while !subscriber.is_cancellation_requested() {
        let batch = channel
            .next_batch(&mut token, || {
                subscriber.is_cancellation_requested()
                    || channel.termination_state() >= TerminationState::ShutdownStarted
            })
            .await;
        if !batch {
            break;
        }

        while token.next_to_read <= token.end_of_batch {
            let envelope = channel.read(token.next_to_read);
            token.next_to_read += 1;

            if !envelope.terminal {
                (subscriber.callback)(envelope.payload);
            }
        }

        channel.notify_message_consumed(&mut token);
        async_support::yield_now().await;
    }

    log::debug!("subscriber on `{}`: starting termination", channel.name());
    channel.initialize_termination();

    // Deliver what publishers managed to get out before
    // they noticed: an in-flight message is never lost.
    while channel.termination_state() < TerminationState::ShutdownConfirmed
        && channel.publishers_waiting() > 0
    {
        drain_in_flight(&channel, &mut token, &mut |message| {
            (subscriber.callback)(message)
        });
        async_support::yield_now().await;
    }
    drain_in_flight(&channel, &mut token, &mut |message| {
        (subscriber.callback)(message)
    });

    channel.finalize_termination();
    log::debug!("subscriber on `{}`: terminated", channel.name());
}

/// Spins `transformer` between two channels until either
/// side begins termination, then shuts down the output side
/// followed by the input side.
pub(crate) async fn spin_transformer<A: Flows, B: Flows>(
    upstream: Channel<A>,
    downstream: Channel<B>,
    mut transformer: Cancellable<TransformerFn<A, B>>,
    mut input: SubscriberToken<A>,
) {
    let _cleanup = PanicCleanup::new(|| {
        downstream.confirm_termination();
        upstream.initialize_termination();
        upstream.finalize_termination();
    });

    let mut output = PublishToken::default();

    log::debug!(
        "transformer `{}` -> `{}`: spinning",
        upstream.name(),
        downstream.name()
    );

    if downstream.request_permission_to_publish(&mut output, 1).await {
        'main: while upstream.termination_state() < TerminationState::ShutdownStarted
            && downstream.termination_state() < TerminationState::ShutdownStarted
        {
            let batch = upstream
                .next_batch(&mut input, || {
                    upstream.termination_state() >= TerminationState::ShutdownStarted
                        || downstream.termination_state() >= TerminationState::ShutdownStarted
                })
                .await;
            if !batch {
                break;
            }

            while input.next_to_read <= input.end_of_batch {
                if downstream.termination_state() >= TerminationState::ShutdownStarted {
                    break 'main;
                }

                let envelope = upstream.read(input.next_to_read);
                input.next_to_read += 1;

                if !envelope.terminal {
                    output.stage((transformer.callback)(envelope.payload));
                }
                upstream.notify_message_consumed(&mut input);

                if output.is_full() {
                    downstream.publish_messages(&mut output).await;

                    // Claim just enough for what's left of the
                    // batch so messages aren't held back waiting
                    // for a wide range to fill.
                    let pending = (input.end_of_batch + 1).saturating_sub(input.next_to_read);
                    let want = (pending.max(1) as usize).min(downstream.stride());
                    if !downstream.request_permission_to_publish(&mut output, want).await {
                        break 'main;
                    }
                }
            }

            async_support::yield_now().await;
        }
    }

    // Output side first: whatever is staged goes out (the
    // unfilled tail of the claim is padded with sentinels),
    // then the channel is confirmed and any parked
    // subscribers are released.
    log::debug!(
        "transformer `{}` -> `{}`: shutting down output",
        upstream.name(),
        downstream.name()
    );
    channel_flush(&downstream, &mut output).await;
    downstream.confirm_termination();
    release_waiting_subscribers(&downstream).await;

    // Then the input side, identically to a subscriber.
    // Transformed output has nowhere to go anymore, so the
    // transformer observes the drained messages and the
    // results are dropped.
    upstream.initialize_termination();
    while upstream.termination_state() < TerminationState::ShutdownConfirmed
        && upstream.publishers_waiting() > 0
    {
        drain_in_flight(&upstream, &mut input, &mut |message| {
            let _ = (transformer.callback)(message);
        });
        async_support::yield_now().await;
    }
    drain_in_flight(&upstream, &mut input, &mut |message| {
        let _ = (transformer.callback)(message);
    });
    upstream.finalize_termination();
    log::debug!(
        "transformer `{}` -> `{}`: terminated",
        upstream.name(),
        downstream.name()
    );
}

/// Spins `spinner` until cancellation is requested.
pub(crate) async fn spin_spinner(mut spinner: Cancellable<SpinnerFn>) {
    while !spinner.is_cancellation_requested() {
        async_support::yield_now().await;
        (spinner.callback)();
    }
}

/// Synchronously consumes everything published past the
/// token, delivering non-sentinel payloads to `deliver`.
fn drain_in_flight<T: Flows>(
    channel: &Channel<T>,
    token: &mut SubscriberToken<T>,
    deliver: &mut dyn FnMut(T),
) {
    loop {
        let published = channel.cursor();
        if token.next_to_read >= published {
            break;
        }
        token.end_of_batch = published - 1;

        while token.next_to_read <= token.end_of_batch {
            let envelope = channel.read(token.next_to_read);
            token.next_to_read += 1;

            if !envelope.terminal {
                deliver(envelope.payload);
            }
        }

        channel.notify_message_consumed(token);
    }
}

/// Publishes the token's claim, if any, padding unfilled
/// sequences with sentinels.
async fn channel_flush<T: Flows>(channel: &Channel<T>, token: &mut PublishToken<T>) {
    if token.has_claim() {
        channel.publish_messages(token).await;
    }
}

/// The sentinel drain: while subscribers are parked on the
/// cursor, claim-and-publish terminal envelopes to wake them.
///
/// This is the only mechanism that releases a subscriber
/// whose wait began just before termination was observable.
async fn release_waiting_subscribers<T: Flows>(channel: &Channel<T>) {
    let mut token = PublishToken::default();

    while channel.subscribers_waiting() > 0 {
        if channel.try_claim_for_drain(&mut token, 1) {
            channel.publish_messages(&mut token).await;
        } else {
            async_support::yield_now().await;
        }
    }
}

/// Runs a cleanup closure iff the surrounding task is
/// unwinding, so a panicking user callback can't leave
/// its channels wedged mid-protocol.
struct PanicCleanup<F: FnMut()> {
    cleanup: F,
}

impl<F: FnMut()> PanicCleanup<F> {
    fn new(cleanup: F) -> Self {
        Self { cleanup }
    }
}

impl<F: FnMut()> Drop for PanicCleanup<F> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            (self.cleanup)();
        }
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicU64, Ordering};
    use core::time::Duration;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn channel(capacity: usize) -> Channel<u64> {
        Channel::new("test", capacity, 4)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn publisher_and_subscriber_deliver_in_order() {
        let channel = channel(16);
        let recorded = Arc::new(Mutex::new(Vec::new()));

        let counter = AtomicU64::new(1);
        let publish = Cancellable::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst)
        }) as crate::routine::PublisherFn<u64>);

        let sink = recorded.clone();
        let subscribe = Cancellable::new(Box::new(move |message: u64| {
            sink.lock().push(message);
        }) as crate::routine::SubscriberFn<u64>);
        let cancellation = subscribe.handle();

        let token = channel.add_subscriber();
        let publisher_task = tokio::spawn(spin_publisher(
            channel.clone(),
            publish,
            Pacer::new(None),
        ));
        let subscriber_task = tokio::spawn(spin_subscriber(channel.clone(), subscribe, token));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancellation.request_cancellation();

        tokio::time::timeout(Duration::from_secs(5), publisher_task)
            .await
            .expect("publisher must terminate")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), subscriber_task)
            .await
            .expect("subscriber must terminate")
            .unwrap();

        let recorded = recorded.lock();
        assert!(!recorded.is_empty());

        // Strictly increasing run starting at 1: in order,
        // no losses, no duplicates, and no `0` sentinels
        // leaked into the callback.
        for (i, message) in recorded.iter().enumerate() {
            assert_eq!(i as u64 + 1, *message);
        }

        assert_eq!(TerminationState::Drained, channel.termination_state());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publisher_exits_on_terminated_channel() {
        let channel = channel(8);
        channel.initialize_termination();

        let publish = Cancellable::new(Box::new(|| 7_u64) as crate::routine::PublisherFn<u64>);

        tokio::time::timeout(
            Duration::from_secs(5),
            spin_publisher(channel.clone(), publish, Pacer::new(None)),
        )
        .await
        .expect("publisher must bow out of a terminated channel");

        assert!(channel.termination_state() >= TerminationState::ShutdownConfirmed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spinner_stops_on_cancellation() {
        let spins = Arc::new(AtomicU64::new(0));
        let counter = spins.clone();
        let spin = Cancellable::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }) as crate::routine::SpinnerFn);
        let cancellation = spin.handle();

        let task = tokio::spawn(spin_spinner(spin));
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancellation.request_cancellation();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("spinner must terminate")
            .unwrap();
    }
}
