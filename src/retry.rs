//! # Per-Operation Retry Policies
//!
//! Every bulk operation gets its own [`RetryPolicy`] instance when it is
//! admitted. After a batch comes back, the batcher asks the operation's
//! context whether its result should be retried; the context forwards to the
//! policy.
//!
//! ## The Default Policy
//!
//! ```text
//!                     result
//!                       │
//!        ┌──────────────┼─────────────────────────┐
//!        ▼              ▼                         ▼
//!   410 + 1002/1007  413 + 3402               429 (throttled)
//!   1008/1000        response too large             │
//!   range moved            │                        ▼
//!        │                 │               ThrottleRetryPolicy
//!        ▼                 ▼               (attempts, total wait)
//!   RetryAfter(0)     RetryAfter(0)                 │
//!   (re-route)        (re-batch)                    ▼
//!                                          RetryAfter(retry_after)
//! ```
//!
//! Anything else is final and completes the caller's future.
//!
//! ## Rust Pattern: Interior Mutability
//!
//! `should_retry` takes `&self` because policies are reached through an
//! `Arc<OperationContext>`. The attempt counters live behind a
//! `parking_lot::Mutex` so the policy stays `Send + Sync`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::RetryOptions;
use crate::types::{OperationResult, StatusCode, SubStatusCode};

/// Back-off used when a throttled response carries no retry-after hint.
pub const DEFAULT_THROTTLE_BACKOFF: Duration = Duration::from_millis(5);

/// Re-route attempts allowed for one operation before its result is final.
pub const MAX_PARTITION_MOVED_RETRIES: u32 = 10;

// =============================================================================
// Policy Trait
// =============================================================================

/// Decision returned by a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldRetry {
    /// The result is final.
    NoRetry,
    /// Re-batch the operation after the given delay.
    RetryAfter(Duration),
}

impl ShouldRetry {
    pub fn is_retry(&self) -> bool {
        matches!(self, ShouldRetry::RetryAfter(_))
    }
}

/// Decides whether an operation result should be retried.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, result: &OperationResult) -> ShouldRetry;
}

/// Creates one policy per admitted operation. `None` disables retries.
pub type RetryPolicyFactory = Arc<dyn Fn() -> Option<Box<dyn RetryPolicy>> + Send + Sync>;

/// Factory for the default [`BulkRetryPolicy`].
pub fn bulk_policy_factory(options: RetryOptions) -> RetryPolicyFactory {
    Arc::new(move || Some(Box::new(BulkRetryPolicy::new(&options)) as Box<dyn RetryPolicy>))
}

/// Factory that never retries.
pub fn no_retry_factory() -> RetryPolicyFactory {
    Arc::new(|| None)
}

// =============================================================================
// Throttle Policy
// =============================================================================

#[derive(Debug, Default)]
struct ThrottleState {
    attempts: u32,
    waited: Duration,
}

/// Retries 429 responses, honouring the backend's retry-after hint.
#[derive(Debug)]
pub struct ThrottleRetryPolicy {
    max_attempts: u32,
    max_wait: Duration,
    state: Mutex<ThrottleState>,
}

impl ThrottleRetryPolicy {
    pub fn new(max_attempts: u32, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            max_wait,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// Number of retries granted so far.
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }
}

impl RetryPolicy for ThrottleRetryPolicy {
    fn should_retry(&self, result: &OperationResult) -> ShouldRetry {
        if result.status != StatusCode::TOO_MANY_REQUESTS {
            return ShouldRetry::NoRetry;
        }

        let delay = result.retry_after.unwrap_or(DEFAULT_THROTTLE_BACKOFF);
        let mut state = self.state.lock();
        if state.attempts >= self.max_attempts || state.waited + delay > self.max_wait {
            return ShouldRetry::NoRetry;
        }
        state.attempts += 1;
        state.waited += delay;
        ShouldRetry::RetryAfter(delay)
    }
}

// =============================================================================
// Bulk Policy
// =============================================================================

/// Default bulk policy: re-route moved ranges, otherwise throttle retry.
#[derive(Debug)]
pub struct BulkRetryPolicy {
    throttle: ThrottleRetryPolicy,
    moved_attempts: Mutex<u32>,
}

impl BulkRetryPolicy {
    pub fn new(options: &RetryOptions) -> Self {
        Self {
            throttle: ThrottleRetryPolicy::new(
                options.max_throttle_retries,
                options.max_throttle_wait(),
            ),
            moved_attempts: Mutex::new(0),
        }
    }
}

impl RetryPolicy for BulkRetryPolicy {
    fn should_retry(&self, result: &OperationResult) -> ShouldRetry {
        let response_too_large = result.status == StatusCode::REQUEST_ENTITY_TOO_LARGE
            && result.sub_status == SubStatusCode::RESPONSE_SIZE_EXCEEDED;

        if result.is_partition_moved() || response_too_large {
            let mut attempts = self.moved_attempts.lock();
            if *attempts >= MAX_PARTITION_MOVED_RETRIES {
                return ShouldRetry::NoRetry;
            }
            *attempts += 1;
            return ShouldRetry::RetryAfter(Duration::ZERO);
        }

        self.throttle.should_retry(result)
    }
}

// =============================================================================
// Tests
// =============================================================================
