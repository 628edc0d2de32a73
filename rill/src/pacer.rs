//! Publishing-rate enforcement.
//!
//! The pacer is a spin-wait: it never parks on a timer
//! facility, it just measures elapsed wall-clock between
//! readiness checks and the publisher driver yields to the
//! scheduler between checks so a waiting publisher never
//! monopolizes a worker.

use core::time::Duration;
use std::time::Instant;

use crate::async_support;

/// A publishing rate, in cycles per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frequency {
    hertz: f64,
}

/// Returns a [`Frequency`] of `hertz` cycles per second.
///
/// # Panics
///
/// Iff `hertz` is not a positive, finite number.
pub fn frequency(hertz: f64) -> Frequency {
    assert!(
        hertz.is_finite() && hertz > 0.0,
        "a frequency _must_ be a positive number of hertz, not {hertz}"
    );
    Frequency { hertz }
}

impl Frequency {
    pub fn hertz(&self) -> f64 {
        self.hertz
    }

    /// The period between two cycles at this frequency.
    pub fn period(&self) -> Duration {
        Duration::from_nanos((1_000_000_000.0 / self.hertz) as u64)
    }
}

/// Spin-wait pacer holding a target period.
#[derive(Debug)]
pub(crate) struct Pacer {
    period: Option<Duration>,
    last_timestamp: Instant,
    elapsed: Duration,
}

impl Pacer {
    /// A pacer for `frequency`, or an always-ready pacer
    /// when no frequency is configured.
    ///
    /// The first tick of a paced pacer fires immediately;
    /// pacing applies between subsequent ticks.
    pub(crate) fn new(frequency: Option<Frequency>) -> Self {
        let period = frequency.map(|frequency| frequency.period());
        Self {
            period,
            last_timestamp: Instant::now(),
            elapsed: period.unwrap_or_default(),
        }
    }

    pub(crate) fn is_paced(&self) -> bool {
        self.period.is_some()
    }

    /// Returns true iff at least one period has elapsed
    /// since the last reset.
    pub(crate) fn is_ready(&mut self) -> bool {
        let Some(period) = self.period else {
            return true;
        };

        let now = Instant::now();
        self.elapsed += now - self.last_timestamp;
        self.last_timestamp = now;

        self.elapsed >= period
    }

    /// Zeroes the elapsed counter.
    pub(crate) fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }

    /// Waits for the next tick, yielding to the scheduler
    /// between readiness checks. Aborts early (without
    /// resetting) when `interrupt` fires.
    pub(crate) async fn tick(&mut self, interrupt: impl Fn() -> bool) {
        if self.period.is_none() {
            return;
        }

        while !self.is_ready() {
            if interrupt() {
                return;
            }
            async_support::yield_now().await;
        }

        self.reset();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unpaced_is_always_ready() {
        let mut pacer = Pacer::new(None);
        assert!(!pacer.is_paced());
        assert!(pacer.is_ready());
        pacer.reset();
        assert!(pacer.is_ready());
    }

    #[test]
    fn first_tick_is_immediate() {
        let mut pacer = Pacer::new(Some(frequency(1.0)));
        assert!(pacer.is_paced());
        assert!(pacer.is_ready());
    }

    #[test]
    fn reset_restarts_the_period() {
        let mut pacer = Pacer::new(Some(frequency(1000.0)));
        pacer.reset();

        // One millisecond has very likely not elapsed yet;
        // but sleep past it and readiness must hold.
        std::thread::sleep(Duration::from_millis(5));
        assert!(pacer.is_ready());

        pacer.reset();
        std::thread::sleep(Duration::from_millis(5));
        assert!(pacer.is_ready());
    }

    #[test]
    fn elapsed_accumulates_across_checks() {
        let mut pacer = Pacer::new(Some(frequency(100.0)));
        pacer.reset();

        let deadline = Instant::now() + Duration::from_millis(50);
        let mut became_ready = false;
        while Instant::now() < deadline {
            if pacer.is_ready() {
                became_ready = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(became_ready, "a 10ms period must elapse within 50ms");
    }

    #[test]
    fn period_conversion() {
        assert_eq!(Duration::from_millis(100), frequency(10.0).period());
        assert_eq!(Duration::from_millis(50), frequency(20.0).period());
        assert_eq!(Duration::from_secs(1), frequency(1.0).period());
    }

    #[test]
    #[should_panic]
    fn frequencies_must_be_positive() {
        frequency(0.0);
    }

    #[tokio::test]
    async fn tick_aborts_on_interrupt() {
        let mut pacer = Pacer::new(Some(frequency(0.001)));
        pacer.reset();

        // A 1000-second period: only the interrupt
        // can end this tick.
        pacer.tick(|| true).await;
    }
}
