//! Time utilities — wall-clock and monotonic millisecond timestamps.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Elapsed time since `start` in **milliseconds**, as a float for latency
/// arithmetic.
#[inline]
pub fn elapsed_ms(start: Instant) -> f64 {
    duration_ms(start.elapsed())
}

/// A `Duration` in fractional milliseconds.
#[inline]
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}
