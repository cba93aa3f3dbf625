//! In this module, we keep the runtime stats of an acquisition run.
//! Nothing here feeds back into control flow; it only ends up in the logs.

use std::{fmt, time::Duration};

/// Running statistics over a series of durations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    count: u32,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl Timing {
    pub fn record(&mut self, d: Duration) {
        self.count += 1;
        self.total += d;
        self.min = Some(self.min.map_or(d, |m| m.min(d)));
        self.max = self.max.max(d);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.total / self.count)
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.mean()) {
            (Some(min), Some(mean)) => write!(
                f,
                "n={} min={:?} mean={:?} max={:?}",
                self.count, min, mean, self.max
            ),
            _ => write!(f, "n=0"),
        }
    }
}

/// Impulse responses per second over `elapsed`
pub fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
