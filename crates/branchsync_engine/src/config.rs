//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Upper bound on connections per branch pool. Branch databases are small
/// on-premise servers.
pub const MAX_POOL_SIZE: usize = 4;

/// Engine-wide tuning shared by every branch session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rows per extraction page.
    pub page_size: usize,
    /// Connections per branch pool, at most [`MAX_POOL_SIZE`].
    pub pool_size: usize,
    /// How long `acquire` waits for a free pool slot.
    pub acquire_timeout: Duration,
    /// Timeout for opening a source connection.
    pub connect_timeout: Duration,
    /// Timeout for a single source query.
    pub query_timeout: Duration,
    /// How often idle pooled connections are pinged.
    pub health_check_interval: Duration,
    /// Buffered log events per branch before slow subscribers lag.
    pub log_capacity: usize,
    /// Backoff for reconnecting after a connection failure.
    pub reconnect: RetryConfig,
    /// Backoff for retrying a failed delivery.
    pub delivery: RetryConfig,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            page_size: 1000,
            pool_size: MAX_POOL_SIZE,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            log_capacity: 1024,
            reconnect: RetryConfig::default(),
            delivery: RetryConfig::default(),
        }
    }

    /// Sets the page size (at least 1).
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the pool size, clamped to `1..=MAX_POOL_SIZE`.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.clamp(1, MAX_POOL_SIZE);
        self
    }

    /// Sets the pool acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Sets the idle health-check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the per-branch log buffer.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, retry: RetryConfig) -> Self {
        self.reconnect = retry;
        self
    }

    /// Sets the delivery retry backoff.
    pub fn with_delivery_retry(mut self, retry: RetryConfig) -> Self {
        self.delivery = retry;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff. Retries are unbounded; only the delay is capped.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration starting at `initial_delay`.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Constant delay without jitter. Handy for tests.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
