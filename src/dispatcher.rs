//! # Dispatcher: Bulk Execution for One Container
//!
//! The [`Dispatcher`] is the entry point of the bulk pipeline for a single
//! container. It validates and routes operations, owns one [`Streamer`] and
//! one concurrency gate per partition key range, and provides the executor
//! and retrier delegates every batcher calls back into.
//!
//! ## Flow
//!
//! ```text
//!  add(op) ─► validate ─► materialize ─► resolve range ─► attach context
//!                                                             │
//!                             streamers[range].add(op) ◄──────┘
//!                                       │
//!                            (batcher full / timer)
//!                                       ▼
//!                    RangeExecutor: gates[range].acquire()
//!                                   transport.send(..)
//!                                   BatchResponse::from_wire(..)
//!                                       │
//!                  ┌────────────────────┴──────────────────┐
//!                  ▼                                       ▼
//!          final result: complete             retry: Rebatcher.re_batch(op)
//!                                              ├─ range moved? router refresh
//!                                              ├─ resolve range again
//!                                              └─ streamers[range].add(op)
//! ```
//!
//! ## Rust Pattern: Weak Back-References
//!
//! Streamers hold their executor and retrier as `Arc<dyn Trait>`, and those
//! delegates need the dispatcher's state. Holding a strong `Arc` back to the
//! dispatcher would form a cycle (dispatcher → streamer → delegate →
//! dispatcher) that never drops, so the delegates hold a `Weak` and upgrade
//! it per call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::{BatchExecutor, BatchRetrier};
use crate::codec::{encoded_record_len, BatchResponse, PackedBatch};
use crate::config::BulkConfig;
use crate::context::{OperationContext, PendingResult};
use crate::error::{Error, Result};
use crate::retry::RetryPolicyFactory;
use crate::schema::MAX_RECORD_BYTES;
use crate::streamer::Streamer;
use crate::transport::{
    BatchHeaders, ItemSerializer, PartitionRouter, RequestTarget, Transport, WireRequest,
};
use crate::types::{
    ContainerId, ItemOperation, ItemRequestOptions, OperationResult, RangeId, Resource,
};

// =============================================================================
// Dispatcher
// =============================================================================

/// Shared collaborators a dispatcher is built from.
#[derive(Clone)]
pub struct DispatcherParts {
    pub config: BulkConfig,
    pub transport: Arc<dyn Transport>,
    pub router: Arc<dyn PartitionRouter>,
    pub serializer: Arc<dyn ItemSerializer>,
    pub retry_policies: RetryPolicyFactory,
}

/// Bulk executor for one container.
///
/// Cheap to clone; all clones share the same streamers and gates.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    container: ContainerId,
    parts: DispatcherParts,
    streamers: DashMap<RangeId, Arc<Streamer>>,
    gates: DashMap<RangeId, Arc<Semaphore>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    self_ref: Weak<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("container", &self.inner.container)
            .field("streamers", &self.inner.streamers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher whose token is a child of `parent_cancel`.
    ///
    /// # Errors
    ///
    /// `Error::Config` if `parts.config` fails validation.
    pub fn new(
        container: ContainerId,
        parts: DispatcherParts,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        parts.config.validate()?;
        let inner = Arc::new_cyclic(|self_ref| DispatcherInner {
            container,
            parts,
            streamers: DashMap::new(),
            gates: DashMap::new(),
            cancel: parent_cancel.child_token(),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        Ok(Self { inner })
    }

    pub fn container(&self) -> &ContainerId {
        &self.inner.container
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled()
    }

    /// Ranges that currently have a streamer.
    pub fn active_ranges(&self) -> Vec<RangeId> {
        self.inner.streamers.iter().map(|e| e.key().clone()).collect()
    }

    /// Admits an operation and returns the future of its result.
    ///
    /// # Errors
    ///
    /// Returned immediately, before anything is queued:
    /// - `Cancelled` if `cancel` already fired
    /// - `DispatcherClosed` after [`Dispatcher::close`]
    /// - `UnsupportedOption` for options bulk cannot honour
    /// - `InvalidOperation` for a missing id or partition key, or bad
    ///   effective-partition-key pairing
    /// - `OperationTooLarge` above [`MAX_RECORD_BYTES`]
    /// - `Routing` / `Serialization` from the collaborators
    pub async fn add(
        &self,
        mut op: ItemOperation,
        options: Option<ItemRequestOptions>,
        cancel: &CancellationToken,
    ) -> Result<PendingResult> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_closed() {
            return Err(Error::DispatcherClosed);
        }
        if options.is_some() {
            op.options = options;
        }

        validate_operation(&op)?;

        if let Resource::Value(value) = &op.resource {
            op.resource = Resource::Raw(self.inner.parts.serializer.to_bytes(value)?);
        }
        if let Some(pk) = &op.partition_key {
            op.partition_key_json = Some(pk.to_json());
        }

        let size = encoded_record_len(&op)?;
        if size > MAX_RECORD_BYTES {
            return Err(Error::OperationTooLarge {
                size,
                limit: MAX_RECORD_BYTES,
            });
        }

        let range = self.inner.resolve(&op).await?;
        let (context, pending) =
            OperationContext::new(range.clone(), (self.inner.parts.retry_policies)());
        op.attach_context(context)?;

        self.inner.streamer_for(&range)?.add(op);
        Ok(pending)
    }

    /// Admits an operation and waits for its result.
    ///
    /// Cancelling `cancel` while waiting returns `Cancelled`; the operation
    /// itself may still be executed.
    pub async fn execute(
        &self,
        op: ItemOperation,
        options: Option<ItemRequestOptions>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let pending = self.add(op, options, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = pending => result,
        }
    }

    /// Dispatches every range's partially filled batcher now.
    pub fn flush(&self) {
        for entry in self.inner.streamers.iter() {
            entry.value().flush();
        }
    }

    /// Cancels in-flight work and fails everything still queued.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let streamers: Vec<Arc<Streamer>> = self
            .inner
            .streamers
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for streamer in &streamers {
            streamer.shutdown();
        }
        self.inner.streamers.clear();
        self.inner.gates.clear();

        info!(container = %self.inner.container, ranges = streamers.len(), "dispatcher closed");
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_operation(op: &ItemOperation) -> Result<()> {
    let has_epk = op
        .options
        .as_ref()
        .is_some_and(|o| o.effective_partition_key_string.is_some());

    if let Some(options) = &op.options {
        options.validate_for_bulk()?;
        options.validate_effective_partition_key(op.partition_key.is_some())?;
    }

    if op.partition_key.is_none() && !has_epk {
        return Err(Error::InvalidOperation(format!(
            "{} operation requires a partition key",
            op.kind
        )));
    }
    if op.kind.requires_id() && op.id.as_deref().map_or(true, str::is_empty) {
        return Err(Error::InvalidOperation(format!(
            "{} operation requires an item id",
            op.kind
        )));
    }
    if op.kind.has_body() && matches!(op.resource, Resource::Empty) {
        return Err(Error::InvalidOperation(format!(
            "{} operation requires a resource body",
            op.kind
        )));
    }
    Ok(())
}

/// Key used for routing: the partition key json, else the EPK string.
fn routing_key(op: &ItemOperation) -> Result<String> {
    if let Some(pk) = &op.partition_key_json {
        return Ok(pk.clone());
    }
    op.options
        .as_ref()
        .and_then(|o| o.effective_partition_key_string.clone())
        .ok_or_else(|| Error::InvalidOperation("operation has no routing key".into()))
}

// =============================================================================
// Inner State
// =============================================================================

impl DispatcherInner {
    async fn resolve(&self, op: &ItemOperation) -> Result<RangeId> {
        let key = routing_key(op)?;
        self.parts.router.resolve_range(&self.container, &key).await
    }

    /// Returns the range's streamer, creating it on first use.
    ///
    /// Two tasks may race to create the same streamer. The loser's candidate
    /// is shut down before anything was added to it.
    fn streamer_for(&self, range: &RangeId) -> Result<Arc<Streamer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DispatcherClosed);
        }
        if let Some(existing) = self.streamers.get(range) {
            return Ok(existing.value().clone());
        }

        let candidate = self.create_streamer(range);
        let streamer = match self.streamers.entry(range.clone()) {
            Entry::Occupied(entry) => {
                let winner = entry.get().clone();
                drop(entry);
                candidate.shutdown();
                winner
            }
            Entry::Vacant(entry) => {
                debug!(container = %self.container, range = %range, "created streamer");
                entry.insert(candidate.clone());
                candidate
            }
        };
        Ok(streamer)
    }

    fn create_streamer(&self, range: &RangeId) -> Arc<Streamer> {
        let config = &self.parts.config;
        Streamer::new(
            range.clone(),
            config.max_operations_per_request,
            config.max_request_body_bytes,
            config.flush_interval(),
            Arc::new(RangeExecutor {
                dispatcher: self.self_ref.clone(),
                range: range.clone(),
            }),
            Arc::new(Rebatcher {
                dispatcher: self.self_ref.clone(),
            }),
            self.cancel.clone(),
        )
    }

    fn gate_for(&self, range: &RangeId) -> Arc<Semaphore> {
        self.gates
            .entry(range.clone())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.parts.config.max_concurrency_per_range))
            })
            .clone()
    }

    async fn send_batch(
        &self,
        range: &RangeId,
        batch: PackedBatch,
        cancel: &CancellationToken,
    ) -> Result<Vec<OperationResult>> {
        let gate = self.gate_for(range);
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = gate.acquire_owned() => permit.map_err(|_| Error::DispatcherClosed)?,
        };

        let operation_count = batch.packed_count;
        let request = WireRequest {
            container: self.container.clone(),
            target: RequestTarget::Range(range.clone()),
            headers: BatchHeaders::bulk(),
            operation_count,
            body: batch.body,
        };

        let wire = self.parts.transport.send(request, cancel).await?;
        debug!(
            container = %self.container,
            range = %range,
            status = %wire.status,
            operations = operation_count,
            "batch response received"
        );
        Ok(BatchResponse::from_wire(wire, operation_count).results)
    }

    async fn re_batch(
        &self,
        op: ItemOperation,
        last_result: Option<OperationResult>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DispatcherClosed);
        }
        let previous = op.context().map(|c| c.range_id());

        if let (Some(result), Some(previous)) = (&last_result, &previous) {
            if result.is_partition_moved() {
                let changed = self
                    .parts
                    .router
                    .routing_changed(&self.container, previous)
                    .await?;
                warn!(
                    container = %self.container,
                    range = %previous,
                    sub_status = %result.sub_status,
                    routing_changed = changed,
                    "partition moved, re-routing operation"
                );
            }
        }

        let range = self.resolve(&op).await?;
        if let Some(context) = op.context() {
            context.reroute(range.clone());
        }
        self.streamer_for(&range)?.add(op);
        Ok(())
    }
}

// =============================================================================
// Delegates
// =============================================================================

/// Executor delegate bound to one range.
struct RangeExecutor {
    dispatcher: Weak<DispatcherInner>,
    range: RangeId,
}

#[async_trait]
impl BatchExecutor for RangeExecutor {
    async fn execute(
        &self,
        batch: PackedBatch,
        cancel: &CancellationToken,
    ) -> Result<Vec<OperationResult>> {
        let dispatcher = self.dispatcher.upgrade().ok_or(Error::DispatcherClosed)?;
        dispatcher.send_batch(&self.range, batch, cancel).await
    }
}

/// Retrier delegate: re-resolves the range and re-adds the operation.
struct Rebatcher {
    dispatcher: Weak<DispatcherInner>,
}

#[async_trait]
impl BatchRetrier for Rebatcher {
    async fn re_batch(&self, op: ItemOperation, last_result: Option<OperationResult>) {
        let context = op.context().cloned();
        let outcome = match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.re_batch(op, last_result).await,
            None => Err(Error::DispatcherClosed),
        };
        if let (Err(e), Some(context)) = (outcome, context) {
            warn!(error = %e, "could not re-batch operation");
            let _ = context.abort(e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
