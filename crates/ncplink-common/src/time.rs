use core::time::Duration;

/// An opaque point in time produced by a [`Clock`] implementation.
///
/// The link engine never interprets the contents of an `Instant`; it only
/// ever asks a `Clock` for the elapsed duration since one was taken. This
/// keeps the no_std core agnostic of whatever timebase the host platform
/// runs (a monotonic clock on a PC, a free-running cycle counter on an MCU).
pub trait Clock: Clone {
    type TInstant: Copy;

    fn current_instant(&self) -> Self::TInstant;
    fn diff(&self, newer: Self::TInstant, older: Self::TInstant) -> TimeDiff;

    /// Duration elapsed between `earlier` and now. Saturates to zero if the
    /// clock went backwards.
    fn elapsed(&self, earlier: Self::TInstant) -> Duration {
        match self.diff(self.current_instant(), earlier) {
            TimeDiff::Forward(d) => d,
            TimeDiff::Backward(_) => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TimeDiff {
    Forward(Duration),
    Backward(Duration),
}
