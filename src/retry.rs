//! Bounded retry policy shared by the reconnecting clients.

use std::time::Duration;

/// Number of attempts and fixed delay between them.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use dbkit::retry::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(5));
/// assert_eq!(policy.max_attempts(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy. At least one attempt is always made.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            delay,
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns a policy with a different attempt count.
    #[must_use]
    pub const fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self::new(max_attempts, self.delay)
    }

    /// Returns a policy with a different delay.
    #[must_use]
    pub const fn with_delay(self, delay: Duration) -> Self {
        Self::new(self.max_attempts, delay)
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 2 seconds apart.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn zero_attempts_is_raised_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[rstest]
    fn builders_replace_one_field() {
        let policy = RetryPolicy::default()
            .with_max_attempts(5)
            .with_delay(Duration::from_millis(10));
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay(), Duration::from_millis(10));
    }
}
