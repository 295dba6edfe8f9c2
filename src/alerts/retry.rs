use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::warn;

/// Bounded retry with exponential backoff for blocking calls
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Delay multiplier between tries
    pub backoff: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(3),
            backoff: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed try number `attempt` (zero based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(self.backoff.saturating_pow(attempt))
    }

    /// Call `operation` until it succeeds or the attempts run out.
    /// Sleeps the calling thread between tries.
    pub fn run<T, F>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt + 1 < self.max_attempts {
                        let delay = self.delay_for_attempt(attempt);
                        warn!("{} failed: {}, retrying in {:?}", operation_name, e, delay);
                        std::thread::sleep(delay);
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("{} was never attempted", operation_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff: 2,
        }
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(6));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(12));
    }

    #[test]
    fn test_eventual_success() {
        let calls = Cell::new(0);
        let result = fast(3).run("flaky", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(anyhow!("not yet"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_with_last_error() {
        let calls = Cell::new(0);
        let result: Result<()> = fast(3).run("broken", || {
            calls.set(calls.get() + 1);
            Err(anyhow!("failure {}", calls.get()))
        });
        assert_eq!(result.unwrap_err().to_string(), "failure 3");
        assert_eq!(calls.get(), 3);
    }
}
