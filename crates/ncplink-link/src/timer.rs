//! Adaptive retransmit timer and the not-ready refresh timer.
//!
//! Only the period-adjustment arithmetic lives here; scheduling the actual
//! deadline against a [`ncplink_common::time::Clock`] is the engine's job,
//! since this crate has no opinion on what clock the host provides.

use core::time::Duration;

/// Tracks the ack-wait period using the same exponentially weighted moving
/// average every serial link-layer implementation derived from this family
/// of protocols uses: `T[n+1] = (7*T[n] + elapsed) / 8`. A timeout doubles
/// the period outright (additive-increase-on-success, multiplicative
/// back-off on loss), and every update is clamped to `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct AckTimer {
    period: Duration,
    min: Duration,
    max: Duration,
}

impl AckTimer {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        AckTimer { period: initial.clamp(min, max), min, max }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Folds a freshly observed round-trip time into the running average.
    pub fn on_ack_received(&mut self, elapsed: Duration) {
        let weighted = self.period * 7 + elapsed;
        self.period = (weighted / 8).clamp(self.min, self.max);
    }

    /// A retransmit timer fired with nothing heard back; back off.
    pub fn on_timeout(&mut self) {
        self.period = (self.period * 2).clamp(self.min, self.max);
    }
}

/// Not-Ready refresh timer, counted in 16 ms ticks as the links in this
/// family specify.
pub const NR_TICK: Duration = Duration::from_millis(16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_doubles_and_clamps_to_max() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        let mut timer = AckTimer::new(Duration::from_millis(400), min, max);
        timer.on_timeout();
        assert_eq!(timer.period(), max);
    }

    #[test]
    fn ack_received_pulls_period_toward_observed_rtt() {
        let min = Duration::from_millis(50);
        let max = Duration::from_millis(2000);
        let mut timer = AckTimer::new(Duration::from_millis(800), min, max);
        timer.on_ack_received(Duration::from_millis(0));
        // (7*800 + 0) / 8 = 700
        assert_eq!(timer.period(), Duration::from_millis(700));
    }

    #[test]
    fn period_never_drops_below_min() {
        let min = Duration::from_millis(400);
        let max = Duration::from_millis(2000);
        let mut timer = AckTimer::new(min, min, max);
        for _ in 0..10 {
            timer.on_ack_received(Duration::from_millis(0));
        }
        assert_eq!(timer.period(), min);
    }
}
