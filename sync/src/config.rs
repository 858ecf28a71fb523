//! Configuration for the sync runtime.

use rand::Rng;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tether_engine::MergeStrategy;

/// Sync runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backoff for outbox entries that failed with a transient error
    pub mutation_retry: RetryPolicy,
    /// Backoff for subscription reconnects; `max_attempts` consecutive
    /// failures restart the engine
    pub reconnect: RetryPolicy,
    /// Restarts allowed per `start()` before the engine gives up
    pub max_restarts: u32,
    /// Timeout applied to every remote request
    pub request_timeout: Duration,
    /// Records requested per base sync page
    pub sync_page_size: u32,
    /// Upper bound of records fetched per model in one base sync
    pub sync_max_records: u32,
    /// Models synced concurrently within one dependency layer
    pub base_sync_parallelism: usize,
    /// Per-subscriber event buffer
    pub event_buffer: usize,
    /// Age of a cursor after which base sync fetches everything again
    pub full_sync_interval: Duration,
    pub merge_strategy: MergeStrategy,
}

impl SyncConfig {
    /// Load configuration from the environment, reading a `.env` file first
    /// if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from `TETHER_*` variables returned by `lookup`.
    /// Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mutation_retry = RetryPolicy {
            max_attempts: parse(&lookup, "TETHER_MUTATION_MAX_ATTEMPTS")?
                .unwrap_or(defaults.mutation_retry.max_attempts),
            initial_delay: millis(&lookup, "TETHER_MUTATION_INITIAL_DELAY_MS")?
                .unwrap_or(defaults.mutation_retry.initial_delay),
            max_delay: millis(&lookup, "TETHER_MUTATION_MAX_DELAY_MS")?
                .unwrap_or(defaults.mutation_retry.max_delay),
            multiplier: parse(&lookup, "TETHER_MUTATION_BACKOFF_MULTIPLIER")?
                .unwrap_or(defaults.mutation_retry.multiplier),
            ..defaults.mutation_retry
        };

        let reconnect = RetryPolicy {
            max_attempts: parse(&lookup, "TETHER_RECONNECT_ATTEMPTS")?
                .unwrap_or(defaults.reconnect.max_attempts),
            ..defaults.reconnect.clone()
        };

        let merge_strategy = match lookup("TETHER_MERGE_STRATEGY") {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::UnknownStrategy(value))?,
            None => defaults.merge_strategy,
        };

        let config = Self {
            mutation_retry,
            reconnect,
            max_restarts: parse(&lookup, "TETHER_MAX_RESTARTS")?.unwrap_or(defaults.max_restarts),
            request_timeout: millis(&lookup, "TETHER_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.request_timeout),
            sync_page_size: parse(&lookup, "TETHER_SYNC_PAGE_SIZE")?
                .unwrap_or(defaults.sync_page_size),
            sync_max_records: parse(&lookup, "TETHER_SYNC_MAX_RECORDS")?
                .unwrap_or(defaults.sync_max_records),
            base_sync_parallelism: parse(&lookup, "TETHER_BASE_SYNC_PARALLELISM")?
                .unwrap_or(defaults.base_sync_parallelism),
            event_buffer: parse(&lookup, "TETHER_EVENT_BUFFER")?.unwrap_or(defaults.event_buffer),
            full_sync_interval: parse::<u64>(&lookup, "TETHER_FULL_SYNC_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.full_sync_interval),
            merge_strategy,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (policy, retry) in [
            ("mutation retry", &self.mutation_retry),
            ("reconnect", &self.reconnect),
        ] {
            if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
                return Err(ConfigError::InvalidMultiplier {
                    policy,
                    value: retry.multiplier,
                });
            }
        }

        let checks = [
            ("TETHER_MUTATION_MAX_ATTEMPTS", self.mutation_retry.max_attempts == 0),
            ("TETHER_RECONNECT_ATTEMPTS", self.reconnect.max_attempts == 0),
            ("TETHER_SYNC_PAGE_SIZE", self.sync_page_size == 0),
            ("TETHER_BASE_SYNC_PARALLELISM", self.base_sync_parallelism == 0),
            ("TETHER_EVENT_BUFFER", self.event_buffer == 0),
        ];
        match checks.into_iter().find(|(_, zero)| *zero) {
            Some((var, _)) => Err(ConfigError::Zero(var)),
            None => Ok(()),
        }
    }

    pub fn with_mutation_retry(mut self, retry: RetryPolicy) -> Self {
        self.mutation_retry = retry;
        self
    }

    pub fn with_reconnect(mut self, retry: RetryPolicy) -> Self {
        self.reconnect = retry;
        self
    }

    pub fn with_max_restarts(mut self, restarts: u32) -> Self {
        self.max_restarts = restarts;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sync_page_size(mut self, size: u32) -> Self {
        self.sync_page_size = size.max(1);
        self
    }

    pub fn with_sync_max_records(mut self, max: u32) -> Self {
        self.sync_max_records = max;
        self
    }

    pub fn with_base_sync_parallelism(mut self, parallelism: usize) -> Self {
        self.base_sync_parallelism = parallelism.max(1);
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    pub fn with_full_sync_interval(mut self, interval: Duration) -> Self {
        self.full_sync_interval = interval;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mutation_retry: RetryPolicy::new(5),
            reconnect: RetryPolicy::new(3).with_initial_delay(Duration::from_millis(500)),
            max_restarts: 5,
            request_timeout: Duration::from_secs(30),
            sync_page_size: 1000,
            sync_max_records: 10_000,
            base_sync_parallelism: 4,
            event_buffer: 256,
            full_sync_interval: Duration::from_secs(24 * 60 * 60),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter to delays
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// A policy that retries immediately. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the retry following `attempt` failures (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = base.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.jitter && delay > 0.0 {
            let jitter = delay * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay + jitter)
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("unknown merge strategy: {0}")]
    UnknownStrategy(String),

    #[error("{policy} backoff multiplier must be finite and at least 1, got {value}")]
    InvalidMultiplier { policy: &'static str, value: f64 },
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(None),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, var)?.map(Duration::from_millis))
}
