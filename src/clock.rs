//! Fixed-interval tick source for the controller loop.

use std::time::{Duration, Instant};

/// Sleeps to absolute boundaries `origin + k * interval`, so sleep jitter does not accumulate.
///
/// When the caller falls behind by one or more whole intervals the skipped boundaries are
/// counted as missed and the clock resynchronises to the next future boundary.
#[derive(Debug, Clone)]
pub struct SamplingClock {
    interval: Duration,
    origin: Instant,
    next: Instant,
    ticks: u64,
    missed: u64,
}

impl SamplingClock {
    /// Clock whose first boundary is one `interval` after `origin`.
    pub fn starting_at(origin: Instant, interval: Duration) -> Self {
        Self {
            interval,
            origin,
            next: origin + interval,
            ticks: 0,
            missed: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Boundaries reached so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Boundaries skipped because the loop overran.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Block until the next boundary and return the instant the thread actually woke.
    ///
    /// After an overrun the returned instant lies past the consumed boundary; the skipped
    /// boundaries show up in [`missed`](Self::missed).
    pub fn wait(&mut self) -> Instant {
        if let Some(remaining) = self.next.checked_duration_since(Instant::now()) {
            std::thread::sleep(remaining);
        }
        let woke = Instant::now();
        self.advance(woke);
        woke
    }

    /// Consume the boundary due at or before `now`, accounting for any that were skipped.
    fn advance(&mut self, now: Instant) -> Instant {
        let boundary = self.next;
        self.ticks += 1;
        let late = now.saturating_duration_since(boundary);
        let skipped = if self.interval.is_zero() {
            0
        } else {
            (late.as_nanos() / self.interval.as_nanos()) as u64
        };
        self.missed += skipped;
        self.next = boundary + self.interval * u32::try_from(skipped + 1).unwrap_or(u32::MAX);
        boundary
    }

    /// Time since the origin.
    pub fn elapsed_at(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.origin)
    }
}
