//! Per-venue round-trip latency tracking.
//!
//! Each venue connection records latency samples — the connect handshake
//! and subsequent REST round trips. The scorer reads the smoothed value as
//! the latency component of the composite score. An exponentially weighted
//! moving average keeps the value responsive without a full histogram.

/// EWMA smoothing factor for new samples.
const ALPHA: f64 = 0.3;

/// A smoothed round-trip latency estimate for one venue.
///
/// Not thread-safe — callers wrap it in whatever lock guards the venue's
/// connection entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttTracker {
    avg_ms: f64,
    last_ms: f64,
    count: u64,
}

impl RttTracker {
    /// A tracker seeded with one initial sample (typically the connect
    /// round trip).
    pub fn seeded(sample_ms: f64) -> Self {
        let mut tracker = Self::default();
        tracker.record(sample_ms);
        tracker
    }

    /// Record one round-trip sample in milliseconds.
    pub fn record(&mut self, sample_ms: f64) {
        self.last_ms = sample_ms;
        self.count += 1;
        if self.count == 1 {
            self.avg_ms = sample_ms;
        } else {
            self.avg_ms = ALPHA * sample_ms + (1.0 - ALPHA) * self.avg_ms;
        }
    }

    /// Smoothed latency in milliseconds, or `None` before any sample.
    pub fn average_ms(&self) -> Option<f64> {
        (self.count > 0).then_some(self.avg_ms)
    }

    /// Most recent raw sample.
    pub fn last_ms(&self) -> f64 {
        self.last_ms
    }

    /// Number of recorded samples.
    pub fn count(&self) -> u64 {
        self.count
    }
}
