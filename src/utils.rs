use std::time::Duration;

use rand::Rng;

/// The current wall-clock time as milliseconds since the Unix epoch.
///
/// Best effort only; the protocol never assumes peer clocks are synchronized beyond this.
pub fn now_ms() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

/// A uniformly random duration in `[base, base + range)` milliseconds.
pub fn jittered_ms(base: u64, range: u64) -> Duration {
    let jitter = if range == 0 { 0 } else { rand::thread_rng().gen_range(0..range) };
    Duration::from_millis(base + jitter)
}
