//! Monotonic microsecond clock for input timestamps and heartbeat tokens.
//!
//! Values count from the first call in this process, so they never jump
//! backwards with wall-clock adjustments. They mean nothing to the peer beyond
//! relative spacing; ordering is decided by sequence numbers.

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Microseconds elapsed since the process-local epoch.
pub fn monotonic_micros() -> u64 {
    u64::try_from(epoch().elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_micros_never_decreases() {
        let first = monotonic_micros();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = monotonic_micros();
        assert!(second > first);
    }
}
