//! # bulkdb - Bulk Batching for a Partitioned Document Store
//!
//! bulkdb is the client-side core that turns many independent item
//! operations into few physical requests. It provides:
//!
//! - **Continuous batching**: operations stream into per-range batchers that
//!   are sent when full or when a timer fires
//! - **Exactly-once completion**: every submitted operation resolves once,
//!   with its own result, regardless of which physical request carried it
//! - **Transparent retries**: throttling and partition moves are retried
//!   per operation, re-routing when a range splits
//! - **Transactional batches**: explicit all-or-nothing groups on one
//!   partition key, sharing the same wire codec
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   BulkClient / Container                        │
//! │        (create_item, read_item, ..., transactional_batch)       │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │             Dispatcher (one per container)                      │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │  Streamer   │  │  Streamer   │  │  Semaphore per range    │ │
//! │  │ (range "0") │  │ (range "1") │  │  (in-flight requests)   │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ packed record stream
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Transport + PartitionRouter                     │
//! │          (network client, or MemoryBackend in tests)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single resolution**: a `PendingResult` resolves exactly once
//! 2. **Ownership**: only the batcher currently holding an operation may
//!    complete it
//! 3. **Bounded requests**: no request exceeds the configured operation
//!    count, and only a lone oversized operation may exceed the byte budget
//! 4. **Positional results**: result `i` belongs to the operation at index `i`
//!    of the request that carried it
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum for every failure mode
//! - [`schema`]: Constant record-stream layout
//! - [`types`]: Domain types (ItemOperation, OperationResult, StatusCode, ...)
//! - [`codec`]: Record-stream packing and unpacking
//! - [`config`]: Tunables with defaults and environment overrides
//! - [`retry`]: Per-operation retry policies
//! - [`context`]: Single-resolution completion cell
//! - [`batcher`], [`streamer`], [`dispatcher`], [`registry`]: the pipeline
//! - [`transactional`]: Atomic batches
//! - [`api`]: Client facade (main entry point)
//! - [`memory`]: In-memory backend

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for bulkdb operations.
pub mod error;

/// Constant layout of the binary record stream.
pub mod schema;

/// Domain types: identifiers, status codes, operations and results.
pub mod types;

/// Wire request/response shapes and the collaborator traits.
pub mod transport;

/// Record-stream encoding and decoding.
///
/// Packing is greedy and bounded by both size and count; unpacking turns a
/// response into per-operation results, degrading to a uniform error when
/// the body cannot be trusted.
pub mod codec;

/// Pipeline tunables.
pub mod config;

/// Retry policies applied per operation.
pub mod retry;

/// Per-operation completion tracking.
pub mod context;

/// One physical batch: admission, dispatch, result routing.
pub mod batcher;

/// Continuous batching for one partition key range.
pub mod streamer;

/// Per-container bulk executor.
pub mod dispatcher;

/// Container → dispatcher cache.
pub mod registry;

/// Explicit atomic batches on one partition key.
pub mod transactional;

/// Async client facade.
///
/// The main entry point is [`BulkClient`](api::BulkClient).
pub mod api;

/// In-memory partitioned backend for tests and load generation.
pub mod memory;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{BulkClient, Container};
pub use config::{BulkConfig, RetryOptions};
pub use context::PendingResult;
pub use dispatcher::{Dispatcher, DispatcherParts};
pub use error::{Error, Result};
pub use memory::{Fault, MemoryBackend};
pub use retry::{BulkRetryPolicy, RetryPolicy, ShouldRetry};
pub use transactional::{TransactionalBatch, TransactionalBatchResponse};
pub use transport::{ItemSerializer, JsonSerializer, PartitionRouter, Transport};

pub use types::{
    ContainerId, ItemOperation, ItemRequestOptions, OperationKind, OperationResult, PartitionKey,
    RangeId, StatusCode, SubStatusCode,
};
