//! Coordinator configuration
//!
//! Plain structs with defaults and `with_*` builders. Nothing here is
//! loaded from files; embedding applications own that layer.

use std::time::Duration;

/// Configuration for retrying coordinator operations that lost an
/// optimistic race.
///
/// # Example
/// ```ignore
/// let config = RetryConfig::new()
///     .with_max_retries(5)
///     .with_base_delay_ms(10);
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff.
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries.
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate delay for a given attempt (exponential backoff).
    pub(crate) fn calculate_delay(&self, attempt: usize) -> Duration {
        // Cap the shift to prevent overflow
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Coordinator-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Table holding transaction records
    pub tx_table: String,
    /// Table holding before-images
    pub image_table: String,
    /// Idle time after which another actor may complete a transaction
    pub staleness: Duration,
    /// Retry policy for optimistic record races
    pub retry: RetryConfig,
    /// Allow the record-free fast path for small atomic writes
    pub quick_writes: bool,
    /// Idle time after which house-keeping rolls back an Active transaction
    pub rollback_after: Duration,
    /// Age after which house-keeping deletes a terminal record
    pub delete_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tx_table: "transactions".into(),
            image_table: "item_images".into(),
            staleness: Duration::from_secs(3),
            retry: RetryConfig::default(),
            quick_writes: true,
            rollback_after: Duration::from_secs(60),
            delete_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transaction record table name.
    pub fn with_tx_table(mut self, table: impl Into<String>) -> Self {
        self.tx_table = table.into();
        self
    }

    /// Set the before-image table name.
    pub fn with_image_table(mut self, table: impl Into<String>) -> Self {
        self.image_table = table.into();
        self
    }

    /// Set the staleness window authorizing cross-transaction completion.
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable the quick-write fast path.
    pub fn with_quick_writes(mut self, enabled: bool) -> Self {
        self.quick_writes = enabled;
        self
    }

    /// Set the idle window after which Active transactions are swept into
    /// rollback.
    pub fn with_rollback_after(mut self, window: Duration) -> Self {
        self.rollback_after = window;
        self
    }

    /// Set the age after which terminal records are swept away.
    pub fn with_delete_after(mut self, window: Duration) -> Self {
        self.delete_after = window;
        self
    }
}
