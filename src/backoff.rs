//! Exponential backoff with jitter.
//!
//! A [`BackoffPolicy`] describes how a failing remote call is retried:
//! the first wait is `initial_interval`, each following wait grows by
//! `multiplier` up to `max_interval`, and every wait is randomised by
//! `randomization_factor` in both directions. Retrying stops once
//! `max_elapsed_time` has passed since the first attempt, at which point
//! the last error is returned. A zero `max_elapsed_time` disables retries.
//!
//! Policies are configured per service ([`BackoffConfig`]): the GitHub
//! gateway and the LLM client each have their own section, and any field
//! left unset falls back to the `default` section and then to the
//! built-in values.

use std::{
    future::Future,
    time::{Duration, SystemTime},
};

use rand::Rng;
use reqwest_retry::{RetryDecision, RetryPolicy};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 1.5;
const DEFAULT_MAX_ELAPSED_TIME: Duration = Duration::from_secs(60);
const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Fully resolved retry parameters for one service.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub max_elapsed_time: Duration,
    pub randomization_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            max_elapsed_time: DEFAULT_MAX_ELAPSED_TIME,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// A policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_elapsed_time: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Starts a new backoff sequence measured from now.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
            started: Instant::now(),
        }
    }

    /// The policy in the form the `reqwest-retry` middleware takes, for
    /// plain HTTP clients.
    pub fn to_retry_policy(&self) -> HttpRetryPolicy {
        HttpRetryPolicy(self.clone())
    }

    /// Wait before retry number `retries + 1`, before randomisation.
    pub fn interval(&self, retries: u32) -> Duration {
        let initial = self.initial_interval.min(self.max_interval).as_secs_f64();
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let grown = initial * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(grown.min(self.max_interval.as_secs_f64()))
    }

    /// Randomised wait before retry number `retries + 1`, or `None` when
    /// `elapsed` plus that wait would overrun the budget.
    fn delay(&self, retries: u32, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.max_elapsed_time {
            return None;
        }
        let delay = randomize(self.interval(retries), self.randomization_factor);
        if elapsed + delay > self.max_elapsed_time {
            return None;
        }
        Some(delay)
    }
}

/// A [`BackoffPolicy`] driving `RetryTransientMiddleware`.
#[derive(Debug, Clone)]
pub struct HttpRetryPolicy(BackoffPolicy);

impl RetryPolicy for HttpRetryPolicy {
    fn should_retry(&self, request_start_time: SystemTime, n_past_retries: u32) -> RetryDecision {
        let now = SystemTime::now();
        let elapsed = now.duration_since(request_start_time).unwrap_or_default();
        match self.0.delay(n_past_retries, elapsed) {
            Some(delay) => RetryDecision::Retry {
                execute_after: now + delay,
            },
            None => RetryDecision::DoNotRetry,
        }
    }
}

/// Per-field overrides as they appear in the configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackoffOverrides {
    pub initial_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_elapsed_ms: Option<u64>,
    pub randomization_factor: Option<f64>,
}

impl BackoffOverrides {
    /// Applies the overrides on top of `base`.
    pub fn resolve(&self, base: &BackoffPolicy) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: self
                .initial_interval_ms
                .map_or(base.initial_interval, Duration::from_millis),
            max_interval: self
                .max_interval_ms
                .map_or(base.max_interval, Duration::from_millis),
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            max_elapsed_time: self
                .max_elapsed_ms
                .map_or(base.max_elapsed_time, Duration::from_millis),
            randomization_factor: self
                .randomization_factor
                .unwrap_or(base.randomization_factor)
                .clamp(0.0, 1.0),
        }
    }
}

/// The `[backoff]` configuration section.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default)]
    pub default: BackoffOverrides,
    #[serde(default)]
    pub github: BackoffOverrides,
    #[serde(default)]
    pub llm: BackoffOverrides,
}

/// Resolved policies for every service that retries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackoffPolicies {
    pub default: BackoffPolicy,
    pub github: BackoffPolicy,
    pub llm: BackoffPolicy,
}

impl BackoffConfig {
    pub fn resolve(&self) -> BackoffPolicies {
        let default = self.default.resolve(&BackoffPolicy::default());
        BackoffPolicies {
            github: self.github.resolve(&default),
            llm: self.llm.resolve(&default),
            default,
        }
    }
}

/// A running backoff sequence.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    retries: u32,
    started: Instant,
}

impl Backoff {
    /// Returns the next wait, or `None` once the elapsed-time budget is
    /// spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay(self.retries, self.started.elapsed())?;
        self.retries += 1;
        Some(delay)
    }
}

/// Spreads `interval` uniformly over `interval * (1 ± factor)`.
fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let base = interval.as_secs_f64();
    let delta = base * factor.min(1.0);
    let secs = rand::rng().random_range((base - delta)..=(base + delta));
    Duration::from_secs_f64(secs.max(0.0))
}

/// Runs `operation` until it succeeds, the error is not retryable, or the
/// policy's elapsed-time budget runs out. The last error is returned
/// unchanged.
pub async fn retry<T, F, Fut, R>(
    policy: &BackoffPolicy,
    label: &str,
    mut operation: F,
    retryable: R,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    R: Fn(&anyhow::Error) -> bool,
{
    let mut backoff = policy.start();
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) => {
                debug!(operation = label, error = %err, "Permanent failure, not retrying");
                return Err(err);
            }
            Err(err) => match backoff.next_delay() {
                Some(delay) => {
                    debug!(
                        operation = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(operation = label, attempts = attempt, error = %err, "Giving up after retries");
                    return Err(err);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fixed_policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            multiplier: 2.0,
            max_elapsed_time: Duration::from_secs(10),
            randomization_factor: 0.0,
        }
    }

    #[test]
    fn test_overrides_fall_back_to_default_section() {
        let config: BackoffConfig = toml::from_str(
            r#"
            [default]
            initial_interval_ms = 200
            max_elapsed_ms = 5000

            [github]
            max_elapsed_ms = 90000
            "#,
        )
        .unwrap();

        let policies = config.resolve();
        assert_eq!(policies.default.initial_interval, Duration::from_millis(200));
        assert_eq!(policies.github.initial_interval, Duration::from_millis(200));
        assert_eq!(policies.github.max_elapsed_time, Duration::from_secs(90));
        assert_eq!(policies.llm.max_elapsed_time, Duration::from_secs(5));
        assert_eq!(policies.llm.multiplier, DEFAULT_MULTIPLIER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_grow_and_cap() {
        let mut backoff = fixed_policy().start();
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(400),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_multiplier() {
        let policy = BackoffPolicy {
            multiplier: 1.5,
            max_interval: Duration::from_secs(10),
            ..fixed_policy()
        };
        let mut backoff = policy.start();
        let delays: Vec<_> = (0..3).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(150),
                Duration::from_millis(225),
            ]
        );
    }

    #[test]
    fn test_http_policy_follows_backoff_policy() {
        let policy = BackoffPolicy {
            multiplier: 1.5,
            max_interval: Duration::from_secs(10),
            ..fixed_policy()
        }
        .to_retry_policy();

        let start = SystemTime::now();
        let RetryDecision::Retry { execute_after } = policy.should_retry(start, 1) else {
            panic!("expected a retry");
        };
        let wait = execute_after.duration_since(start).unwrap();
        assert!(wait >= Duration::from_millis(150), "{wait:?}");
        assert!(wait < Duration::from_millis(200), "{wait:?}");

        let long_ago = start - Duration::from_secs(11);
        assert!(matches!(
            policy.should_retry(long_ago, 0),
            RetryDecision::DoNotRetry
        ));
        assert!(matches!(
            BackoffPolicy::no_retry().to_retry_policy().should_retry(start, 0),
            RetryDecision::DoNotRetry
        ));
    }

    #[test]
    fn test_http_policy_jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            randomization_factor: 0.2,
            ..fixed_policy()
        }
        .to_retry_policy();
        for _ in 0..50 {
            let start = SystemTime::now();
            let RetryDecision::Retry { execute_after } = policy.should_retry(start, 0) else {
                panic!("expected a retry");
            };
            let wait = execute_after.duration_since(start).unwrap();
            assert!(wait >= Duration::from_millis(80), "{wait:?}");
            assert!(wait < Duration::from_millis(170), "{wait:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            randomization_factor: 0.5,
            ..fixed_policy()
        };
        for _ in 0..50 {
            let delay = policy.start().next_delay().unwrap();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(
            &fixed_policy(),
            "flaky",
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("temporarily unavailable");
                }
                Ok(42)
            },
            |_| true,
        )
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_elapsed() {
        let policy = BackoffPolicy {
            max_elapsed_time: Duration::from_millis(1000),
            ..fixed_policy()
        };
        let calls = AtomicU32::new(0);
        let err = retry(
            &policy,
            "down",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("attempt {n} failed"))
            },
            |_| true,
        )
        .await
        .unwrap_err();

        // 100 + 200 + 400 = 700ms; the next 400ms wait would exceed 1s.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.to_string(), "attempt 3 failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry(
            &fixed_policy(),
            "forbidden",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("403 Forbidden")
            },
            |_| false,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_means_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry(
            &BackoffPolicy::no_retry(),
            "once",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("nope")
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
