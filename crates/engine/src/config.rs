use std::str::FromStr;
use std::time::Duration;

use podflow_pipeline::circuit_breaker::BreakerConfig;
use podflow_pipeline::retry::RetryPolicy;

/// Engine tuning loaded from environment variables.
///
/// Every field has a default suitable for local development.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Jobs allowed in the running state at once (default: `2`).
    pub max_concurrent_jobs: usize,
    /// Overall deadline for one pipeline run (default: 10 minutes).
    pub job_timeout: Duration,
    /// How long terminal jobs are kept before the janitor drops them.
    pub job_retention: Duration,
    pub cleanup_interval: Duration,
    /// Entries per generation cache (prompts and images each).
    pub cache_capacity: usize,
    pub prompt_cache_ttl: Duration,
    pub image_cache_ttl: Duration,
    pub breaker: BreakerConfig,
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_multiplier: f64,
    pub retry_jitter: bool,
    /// Per-call deadline applied to every external request.
    pub call_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(600),
            job_retention: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(300),
            cache_capacity: 512,
            prompt_cache_ttl: Duration::from_secs(3600),
            image_cache_ttl: Duration::from_secs(3600),
            breaker: BreakerConfig::default(),
            retry_max_attempts: retry.max_attempts,
            retry_initial_delay: retry.initial_delay,
            retry_max_delay: retry.max_delay,
            retry_multiplier: retry.multiplier,
            retry_jitter: retry.jitter,
            call_timeout: Duration::from_secs(120),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default |
    /// |-----------------------------|---------|
    /// | `MAX_CONCURRENT_JOBS`       | `2`     |
    /// | `JOB_TIMEOUT_SECS`          | `600`   |
    /// | `JOB_RETENTION_HOURS`       | `24`    |
    /// | `CLEANUP_INTERVAL_SECS`     | `300`   |
    /// | `CACHE_CAPACITY`            | `512`   |
    /// | `PROMPT_CACHE_TTL_SECS`     | `3600`  |
    /// | `IMAGE_CACHE_TTL_SECS`      | `3600`  |
    /// | `BREAKER_FAILURE_THRESHOLD` | `5`     |
    /// | `BREAKER_COOLDOWN_SECS`     | `30`    |
    /// | `BREAKER_WINDOW_SECS`       | `60`    |
    /// | `RETRY_MAX_ATTEMPTS`        | `3`     |
    /// | `RETRY_INITIAL_DELAY_MS`    | `1000`  |
    /// | `RETRY_MAX_DELAY_MS`        | `30000` |
    /// | `RETRY_MULTIPLIER`          | `2.0`   |
    /// | `RETRY_JITTER`              | `true`  |
    /// | `CALL_TIMEOUT_SECS`         | `120`   |
    ///
    /// # Panics
    ///
    /// Panics if a variable is set but does not parse, or if
    /// `MAX_CONCURRENT_JOBS` or `RETRY_MAX_ATTEMPTS` is zero.
    pub fn from_env() -> Self {
        let max_concurrent_jobs: usize = env_or("MAX_CONCURRENT_JOBS", 2);
        assert!(max_concurrent_jobs > 0, "MAX_CONCURRENT_JOBS must be at least 1");
        let retry_max_attempts: u32 = env_or("RETRY_MAX_ATTEMPTS", 3);
        assert!(retry_max_attempts > 0, "RETRY_MAX_ATTEMPTS must be at least 1");

        Self {
            max_concurrent_jobs,
            job_timeout: Duration::from_secs(env_or("JOB_TIMEOUT_SECS", 600)),
            job_retention: Duration::from_secs(env_or::<u64>("JOB_RETENTION_HOURS", 24) * 3600),
            cleanup_interval: Duration::from_secs(env_or("CLEANUP_INTERVAL_SECS", 300)),
            cache_capacity: env_or("CACHE_CAPACITY", 512),
            prompt_cache_ttl: Duration::from_secs(env_or("PROMPT_CACHE_TTL_SECS", 3600)),
            image_cache_ttl: Duration::from_secs(env_or("IMAGE_CACHE_TTL_SECS", 3600)),
            breaker: BreakerConfig {
                failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", 5),
                cooldown: Duration::from_secs(env_or("BREAKER_COOLDOWN_SECS", 30)),
                window: Duration::from_secs(env_or("BREAKER_WINDOW_SECS", 60)),
            },
            retry_max_attempts,
            retry_initial_delay: Duration::from_millis(env_or("RETRY_INITIAL_DELAY_MS", 1000)),
            retry_max_delay: Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 30_000)),
            retry_multiplier: env_or("RETRY_MULTIPLIER", 2.0),
            retry_jitter: env_or("RETRY_JITTER", true),
            call_timeout: Duration::from_secs(env_or("CALL_TIMEOUT_SECS", 120)),
            event_capacity: 1024,
        }
    }

    /// Retry policy for every external call, built from the `retry_*` fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: self.retry_initial_delay,
            max_delay: self.retry_max_delay,
            multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
            call_timeout: Some(self.call_timeout),
            ..RetryPolicy::default()
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{key} must be a valid value: {e}")),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.job_timeout, Duration::from_secs(600));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn retry_policy_carries_config_values() {
        let config = EngineConfig {
            retry_max_attempts: 5,
            retry_initial_delay: Duration::from_millis(10),
            retry_jitter: false,
            call_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(10));
        assert!(!policy.jitter);
        assert_eq!(policy.call_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        assert_eq!(env_or("PODFLOW_TEST_UNSET_VARIABLE", 7u32), 7);
    }
}
