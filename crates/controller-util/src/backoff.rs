//! Exponential backoff for requeued work items.
//!
//! The work queue calls this to decide how long a failing key waits before
//! its next attempt. The delay doubles per consecutive failure, starting at
//! 5ms and capped at 1000 seconds, so a flood of spurious errors for one key
//! quickly backs off without ever parking the key forever.

use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Delay before retrying an item that has already been requeued `requeues`
/// times.
#[must_use]
pub fn for_requeues(requeues: u32) -> Duration {
    // 5ms << 28 already exceeds the cap; keep the shift in range.
    let shift = requeues.min(28);
    let delay = BASE_DELAY.saturating_mul(1u32 << shift);
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base() {
        assert_eq!(for_requeues(0), Duration::from_millis(5));
        assert_eq!(for_requeues(1), Duration::from_millis(10));
        assert_eq!(for_requeues(4), Duration::from_millis(80));
    }

    #[test]
    fn saturates_at_cap() {
        assert_eq!(for_requeues(20), Duration::from_secs(1000));
        assert_eq!(for_requeues(u32::MAX), Duration::from_secs(1000));
    }
}
