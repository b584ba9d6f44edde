//! # External Collaborators
//!
//! The bulk pipeline does not talk to the network, does not own partition
//! routing metadata and does not know how user objects are serialized. It
//! consumes those concerns through the traits in this module:
//!
//! - [`Transport`] exchanges one wire request for one wire response
//! - [`PartitionRouter`] maps a partition key to its current range
//! - [`ItemSerializer`] turns a JSON value into a resource body
//!
//! [`crate::memory::MemoryBackend`] implements the first two for tests and
//! load generation.
//!
//! ## Rust Pattern: async_trait
//!
//! Both `Transport` and `PartitionRouter` are awaited from spawned tasks and
//! stored as `Arc<dyn Trait>`, so they use `#[async_trait]` to get
//! object-safe async methods with `Send` futures.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{ContainerId, RangeId, StatusCode, SubStatusCode};

// =============================================================================
// Wire Request / Response
// =============================================================================

/// Request-level flags sent with a batch body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchHeaders {
    /// The body is a record stream of operations.
    pub is_batch_request: bool,
    /// Keep executing after an operation fails.
    pub continue_on_error: bool,
    /// All-or-nothing execution.
    pub atomic: bool,
    /// Execute in record order.
    pub ordered: bool,
}

impl BatchHeaders {
    /// Flags for a bulk (non-atomic) request.
    pub fn bulk() -> Self {
        Self {
            is_batch_request: true,
            continue_on_error: true,
            atomic: false,
            ordered: false,
        }
    }

    /// Flags for an explicit transactional batch.
    pub fn transactional() -> Self {
        Self {
            is_batch_request: true,
            continue_on_error: false,
            atomic: true,
            ordered: true,
        }
    }
}

/// Where a wire request is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// A partition key range (bulk requests).
    Range(RangeId),
    /// A logical partition, by partition key json (transactional batches).
    PartitionKey(String),
}

/// One physical request carrying a packed record stream.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub container: ContainerId,
    pub target: RequestTarget,
    pub headers: BatchHeaders,
    /// Number of operation records in `body`.
    pub operation_count: usize,
    pub body: Bytes,
}

/// One physical response.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: StatusCode,
    pub sub_status: SubStatusCode,
    pub retry_after: Option<Duration>,
    pub request_charge: f64,
    pub activity_id: String,
    /// Record stream of results, or anything else on request-level errors.
    pub body: Bytes,
}

impl WireResponse {
    /// Creates a response with only a status and a body.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            sub_status: SubStatusCode::UNKNOWN,
            retry_after: None,
            request_charge: 0.0,
            activity_id: String::new(),
            body: body.into(),
        }
    }

    /// Sets the sub-status (builder pattern).
    pub fn with_sub_status(mut self, sub_status: SubStatusCode) -> Self {
        self.sub_status = sub_status;
        self
    }

    /// Sets the retry-after hint (builder pattern).
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Sets the request charge (builder pattern).
    pub fn with_request_charge(mut self, charge: f64) -> Self {
        self.request_charge = charge;
        self
    }

    /// Sets the activity id (builder pattern).
    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = activity_id.into();
        self
    }
}

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Sends wire requests to the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Exchanges one request for one response.
    ///
    /// Returns `Err` only when no response was obtained. Request-level error
    /// statuses (429, 410, ...) come back as `Ok` responses.
    async fn send(&self, request: WireRequest, cancel: &CancellationToken) -> Result<WireResponse>;
}

/// Resolves partition keys to partition key ranges.
#[async_trait]
pub trait PartitionRouter: Send + Sync {
    /// Returns the range currently owning `partition_key_json`.
    async fn resolve_range(&self, container: &ContainerId, partition_key_json: &str)
        -> Result<RangeId>;

    /// Refreshes routing for `range` after a partition-moved signal.
    ///
    /// Returns true when the range is no longer current.
    async fn routing_changed(&self, container: &ContainerId, range: &RangeId) -> Result<bool>;
}

/// Materializes JSON values into resource bodies.
pub trait ItemSerializer: Send + Sync {
    fn to_bytes(&self, value: &Value) -> Result<Bytes>;
}

/// Default serializer: compact JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl ItemSerializer for JsonSerializer {
    fn to_bytes(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}
