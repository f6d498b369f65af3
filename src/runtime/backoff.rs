//! # Fibonacci Backoff
//!
//! Redelivery delays for failed reconcile keys follow the Fibonacci sequence,
//! which grows more slowly than exponential backoff: enough to stop hammering
//! a broken backend without parking a key for long once it recovers.
//!
//! Default sequence (5s min, 300s max): 5s, 5s, 10s, 15s, 25s, 40s, 65s,
//! 105s, 170s, 275s, 300s, 300s, ...

use std::time::Duration;

/// Per-key Fibonacci backoff state. Discarded on the first successful
/// reconcile, so the next failure starts a fresh sequence.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Next delay in the sequence, capped at the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_secs);
        let next = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = next.min(self.max_secs);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follows_fibonacci_sequence() {
        let mut backoff = FibonacciBackoff::new(5, 300);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 5, 10, 15, 25, 40]);
    }

    #[test]
    fn test_caps_at_maximum() {
        let mut backoff = FibonacciBackoff::new(5, 300);
        let last = (0..20).map(|_| backoff.next_delay().as_secs()).last();
        assert_eq!(last, Some(300));
    }

    #[test]
    fn test_fresh_state_restarts_from_minimum() {
        let mut backoff = FibonacciBackoff::new(5, 300);
        for _ in 0..4 {
            let _ = backoff.next_delay();
        }
        // Dropping the state (as the loop does on success) resets the delay.
        backoff = FibonacciBackoff::new(5, 300);
        assert_eq!(backoff.next_delay().as_secs(), 5);
        assert_eq!(backoff.next_delay().as_secs(), 5);
        assert_eq!(backoff.next_delay().as_secs(), 10);
    }
}
