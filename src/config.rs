//! # Bulk Pipeline Configuration
//!
//! All tunables of the bulk pipeline live in [`BulkConfig`]. Defaults match
//! what the backend accepts for a single batch request, so most callers never
//! touch them.
//!
//! ## Loading
//!
//! ```text
//! BulkConfig::default()          built-in defaults (DEFAULT_* constants)
//!        │
//!        ├── BulkConfig::from_json(..)   serde, missing fields keep defaults
//!        │
//!        └── BulkConfig::from_env()      BULKDB_* variables override defaults
//!                 │
//!                 ▼
//!           validate()           rejects zero budgets and intervals
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Maximum operations packed into one bulk request.
pub const DEFAULT_MAX_OPERATIONS_PER_REQUEST: usize = 100;

/// Maximum body size of one bulk request in bytes.
///
/// The backend's request limit minus headroom for request headers.
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 220_201;

/// How often a partially filled batcher is flushed.
///
/// Shorter = lower latency for trickling workloads, longer = fuller requests.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// In-flight requests allowed per partition key range.
pub const DEFAULT_MAX_CONCURRENCY_PER_RANGE: usize = 50;

/// Throttled (429) operations are retried at most this many times.
pub const DEFAULT_MAX_THROTTLE_RETRIES: u32 = 9;

/// Cumulative back-off allowed for one throttled operation.
pub const DEFAULT_MAX_THROTTLE_WAIT_MS: u64 = 30_000;

// =============================================================================
// Configuration Types
// =============================================================================

/// Throttle retry limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Attempts after the first throttled response.
    pub max_throttle_retries: u32,
    /// Upper bound on the sum of all back-off waits, in milliseconds.
    pub max_throttle_wait_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_throttle_retries: DEFAULT_MAX_THROTTLE_RETRIES,
            max_throttle_wait_ms: DEFAULT_MAX_THROTTLE_WAIT_MS,
        }
    }
}

impl RetryOptions {
    pub fn max_throttle_wait(&self) -> Duration {
        Duration::from_millis(self.max_throttle_wait_ms)
    }
}

/// Configuration for the bulk pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Maximum operations per physical request.
    pub max_operations_per_request: usize,

    /// Maximum request body size in bytes.
    pub max_request_body_bytes: usize,

    /// Flush interval for partially filled batchers, in milliseconds.
    pub flush_interval_ms: u64,

    /// Concurrent requests allowed per partition key range.
    pub max_concurrency_per_range: usize,

    /// Throttle retry limits.
    pub retry: RetryOptions,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_operations_per_request: DEFAULT_MAX_OPERATIONS_PER_REQUEST,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_concurrency_per_range: DEFAULT_MAX_CONCURRENCY_PER_RANGE,
            retry: RetryOptions::default(),
        }
    }
}

impl BulkConfig {
    /// Returns the flush interval as a `Duration`.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Sets the flush interval (builder pattern).
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the per-request budgets (builder pattern).
    pub fn with_request_limits(mut self, max_operations: usize, max_body_bytes: usize) -> Self {
        self.max_operations_per_request = max_operations;
        self.max_request_body_bytes = max_body_bytes;
        self
    }

    /// Sets the per-range concurrency (builder pattern).
    pub fn with_max_concurrency_per_range(mut self, max: usize) -> Self {
        self.max_concurrency_per_range = max;
        self
    }

    /// Parses a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from defaults overridden by `BULKDB_*` variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `BULKDB_MAX_OPERATIONS` | `max_operations_per_request` |
    /// | `BULKDB_MAX_BODY_BYTES` | `max_request_body_bytes` |
    /// | `BULKDB_FLUSH_INTERVAL_MS` | `flush_interval_ms` |
    /// | `BULKDB_MAX_CONCURRENCY` | `max_concurrency_per_range` |
    /// | `BULKDB_MAX_THROTTLE_RETRIES` | `retry.max_throttle_retries` |
    /// | `BULKDB_MAX_THROTTLE_WAIT_MS` | `retry.max_throttle_wait_ms` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        override_from(&lookup, "BULKDB_MAX_OPERATIONS", &mut config.max_operations_per_request)?;
        override_from(&lookup, "BULKDB_MAX_BODY_BYTES", &mut config.max_request_body_bytes)?;
        override_from(&lookup, "BULKDB_FLUSH_INTERVAL_MS", &mut config.flush_interval_ms)?;
        override_from(&lookup, "BULKDB_MAX_CONCURRENCY", &mut config.max_concurrency_per_range)?;
        override_from(
            &lookup,
            "BULKDB_MAX_THROTTLE_RETRIES",
            &mut config.retry.max_throttle_retries,
        )?;
        override_from(
            &lookup,
            "BULKDB_MAX_THROTTLE_WAIT_MS",
            &mut config.retry.max_throttle_wait_ms,
        )?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if:
    /// - `max_operations_per_request` is 0
    /// - `max_request_body_bytes` is 0
    /// - `flush_interval_ms` is 0
    /// - `max_concurrency_per_range` is 0
    pub fn validate(&self) -> Result<()> {
        if self.max_operations_per_request == 0 {
            return Err(Error::Config(
                "max_operations_per_request must be >= 1, got 0".into(),
            ));
        }
        if self.max_request_body_bytes == 0 {
            return Err(Error::Config("max_request_body_bytes must be >= 1, got 0".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::Config("flush_interval_ms must be >= 1, got 0".into()));
        }
        if self.max_concurrency_per_range == 0 {
            return Err(Error::Config(
                "max_concurrency_per_range must be >= 1, got 0".into(),
            ));
        }
        Ok(())
    }
}

fn override_from<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()> {
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has invalid value {:?}", key, raw)))?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
