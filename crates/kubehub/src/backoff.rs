//! Retry policy for watchers and the env-driven watch configuration.

use std::time::Duration;

use tracing::warn;

/// Delay strategy applied between a reported watch error and the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay every time.
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential { initial: Duration::from_secs(1), max: Duration::from_secs(30) }
    }
}

/// Stateful cursor over a `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self { Self { policy, attempt: 0 } }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.policy {
            RetryPolicy::Fixed(d) => d,
            RetryPolicy::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
                initial.checked_mul(factor).map_or(max, |d| d.min(max))
            }
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called after a successful (re)connection.
    pub fn reset(&mut self) { self.attempt = 0; }

    pub fn attempts(&self) -> u32 { self.attempt }
}

/// Knobs for watch channels and the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub retry: RetryPolicy,
    /// Upper bound on waiting for a channel to wind down after stop.
    pub stop_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self { Self { retry: RetryPolicy::default(), stop_timeout: Duration::from_secs(5) } }
}

fn env_secs(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = %var, value = %raw, "invalid seconds value; using default");
            None
        }
    }
}

impl WatchConfig {
    /// Read `KVIEW_WATCH_BACKOFF`, `KVIEW_WATCH_BACKOFF_SECS`,
    /// `KVIEW_WATCH_BACKOFF_MAX_SECS` and `KVIEW_STOP_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mode = std::env::var("KVIEW_WATCH_BACKOFF").unwrap_or_else(|_| "exponential".to_string());
        let retry = match mode.as_str() {
            "fixed" => RetryPolicy::Fixed(Duration::from_secs(env_secs("KVIEW_WATCH_BACKOFF_SECS").unwrap_or(10))),
            other => {
                if other != "exponential" { warn!(mode = %other, "unknown KVIEW_WATCH_BACKOFF; using exponential"); }
                let initial = env_secs("KVIEW_WATCH_BACKOFF_SECS").unwrap_or(1).max(1);
                let max = env_secs("KVIEW_WATCH_BACKOFF_MAX_SECS").unwrap_or(30).max(initial);
                RetryPolicy::Exponential { initial: Duration::from_secs(initial), max: Duration::from_secs(max) }
            }
        };
        let stop_timeout = Duration::from_secs(env_secs("KVIEW_STOP_TIMEOUT_SECS").unwrap_or(5));
        Self { retry, stop_timeout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_never_grows() {
        let mut b = Backoff::new(RetryPolicy::Fixed(Duration::from_secs(10)));
        for _ in 0..5 { assert_eq!(b.next_delay(), Duration::from_secs(10)); }
    }

    #[test]
    fn exponential_doubles_then_caps() {
        let mut b = Backoff::new(RetryPolicy::Exponential { initial: Duration::from_secs(1), max: Duration::from_secs(10) });
        let seq: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(seq, vec![1, 2, 4, 8, 10, 10]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn exponential_survives_many_attempts() {
        let mut b = Backoff::new(RetryPolicy::Exponential { initial: Duration::from_secs(1), max: Duration::from_secs(30) });
        for _ in 0..100 { b.next_delay(); }
        assert_eq!(b.next_delay(), Duration::from_secs(30));
    }
}
