//! # Action poll backoff
//!
//! Fibonacci-based delays between action status polls. Assign actions usually
//! finish within a second or two, so the sequence starts small and is capped
//! well below the API rate limit window.
//!
//! Sequence with the defaults: 500ms, 500ms, 1s, 1.5s, 2.5s, 4s, 5s (max).

use std::time::Duration;

/// Fibonacci poll backoff, in milliseconds
#[derive(Debug, Clone)]
pub struct PollBackoff {
    prev_millis: u64,
    current_millis: u64,
    max_millis: u64,
}

impl PollBackoff {
    /// Create a backoff starting at `min_millis` and capped at `max_millis`
    #[must_use]
    pub fn new(min_millis: u64, max_millis: u64) -> Self {
        Self {
            prev_millis: 0,
            current_millis: min_millis,
            max_millis,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current_millis;

        let next = self.prev_millis + self.current_millis;
        self.prev_millis = self.current_millis;
        self.current_millis = std::cmp::min(next, self.max_millis);

        Duration::from_millis(result)
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(500, 5_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_backoff_sequence() {
        let mut backoff = PollBackoff::default();

        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2_500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5_000));
        // 6.5s would be next, capped
        assert_eq!(backoff.next_delay(), Duration::from_millis(5_000));
    }
}
