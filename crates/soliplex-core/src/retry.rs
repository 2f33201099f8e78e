//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration for transient step failures.
///
/// The delay before retry `k` (1-based) is `min(cap, base * 2^(k-1))` with
/// uniform jitter applied on top. Base and cap are engine-wide; the retry
/// *limit* lives on each step.
///
/// # Example
///
/// ```
/// use soliplex_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default().with_jitter(0.0);
/// assert_eq!(policy.delay_for_retry(1), Duration::from_secs(5));
/// assert_eq!(policy.delay_for_retry(2), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base: Duration,

    /// Ceiling on any computed delay (applied before jitter)
    #[serde(with = "duration_millis")]
    pub cap: Duration,

    /// Jitter factor (0.0-1.0); 0.2 means +/-20% randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.2,
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// Jitter keeps the result within `[computed * (1 - jitter),
    /// computed * (1 + jitter)]`, clamped so it never exceeds
    /// `cap * (1 + jitter)` and never goes negative.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exp = retry.saturating_sub(1).min(32);
        let raw = self.base.as_secs_f64() * 2f64.powi(exp as i32);
        let capped = raw.min(self.cap.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let window = capped * self.jitter;
            let offset = rng.gen_range(-window..=window);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base, Duration::from_secs(5));
        assert_eq!(policy.cap, Duration::from_secs(600));
        assert_eq!(policy.jitter, 0.2);
    }

    #[test]
    fn test_exponential_progression() {
        let policy = RetryPolicy::default().with_jitter(0.0);

        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_retry(4), Duration::from_secs(40));
    }

    #[test]
    fn test_cap() {
        let policy = RetryPolicy::default().with_jitter(0.0);

        // 5 * 2^9 = 2560s, well past the 600s cap
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(600));
        // Huge retry counts must not overflow
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn test_zero_retry_has_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
    }

    #[test]
    fn test_jitter_window() {
        let policy = RetryPolicy::default();

        for _ in 0..100 {
            let delay = policy.delay_for_retry(2).as_secs_f64();
            // 10s +/- 20%
            assert!(delay >= 8.0, "delay {delay} below jitter window");
            assert!(delay <= 12.0, "delay {delay} above jitter window");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap_window() {
        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(10));

        for _ in 0..100 {
            let delay = policy.delay_for_retry(20).as_secs_f64();
            assert!(delay <= 12.0);
        }
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::default().with_jitter(0.5);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
