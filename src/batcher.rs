//! # Batcher: One Physical Request in the Making
//!
//! A [`Batcher`] accumulates operations for one partition key range until it
//! is full, then is consumed by [`Batcher::dispatch`], which sends exactly one
//! physical request and fans the results back out to each operation's
//! context.
//!
//! ## Admission vs Packing
//!
//! Admission ([`Batcher::try_add`]) uses the cheap
//! [`approximate_serialized_length`] estimate. Packing at dispatch time
//! measures the real encoded size, so some admitted operations may not fit.
//! Those overflow operations are handed to the [`BatchRetrier`] and land in
//! a later request:
//!
//! ```text
//! admitted:  [op0][op1][op2][op3]
//!                 pack_operations(max_bytes, max_count)
//! packed:    [op0][op1][op2]       ──► BatchExecutor ──► results
//! overflow:                 [op3]  ──► BatchRetrier  ──► next batcher
//! ```
//!
//! ## Rust Pattern: Consuming Dispatch
//!
//! `dispatch(self, ..)` takes the batcher by value. Once a batcher has been
//! handed off, nothing can add to it; the type system enforces what would
//! otherwise be a runtime "already dispatched" flag.
//!
//! [`approximate_serialized_length`]: crate::types::ItemOperation::approximate_serialized_length

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{pack_operations, PackedBatch};
use crate::context::BatcherId;
use crate::error::{Error, Result};
use crate::retry::ShouldRetry;
use crate::types::{ItemOperation, OperationResult, StatusCode};

static NEXT_BATCHER_ID: AtomicU64 = AtomicU64::new(1);

fn next_batcher_id() -> BatcherId {
    NEXT_BATCHER_ID.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Delegates
// =============================================================================

/// Sends one packed request and returns one result per packed operation.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(
        &self,
        batch: PackedBatch,
        cancel: &CancellationToken,
    ) -> Result<Vec<OperationResult>>;
}

/// Takes operations that must go into a later request.
///
/// `last_result` is the result that triggered the retry, or `None` for
/// operations that overflowed packing. Implementations resolve the
/// operation's context themselves if it cannot be re-batched.
#[async_trait]
pub trait BatchRetrier: Send + Sync {
    async fn re_batch(&self, op: ItemOperation, last_result: Option<OperationResult>);
}

// =============================================================================
// Batcher
// =============================================================================

/// Accumulates operations for a single physical request.
pub struct Batcher {
    id: BatcherId,
    operations: Vec<ItemOperation>,
    current_bytes: usize,
    max_count: usize,
    max_bytes: usize,
    executor: Arc<dyn BatchExecutor>,
    retrier: Arc<dyn BatchRetrier>,
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("id", &self.id)
            .field("operations", &self.operations.len())
            .field("current_bytes", &self.current_bytes)
            .field("max_count", &self.max_count)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl Batcher {
    /// Creates an empty batcher with a fresh id.
    pub fn new(
        max_count: usize,
        max_bytes: usize,
        executor: Arc<dyn BatchExecutor>,
        retrier: Arc<dyn BatchRetrier>,
    ) -> Self {
        Self {
            id: next_batcher_id(),
            operations: Vec::new(),
            current_bytes: 0,
            max_count,
            max_bytes,
            executor,
            retrier,
        }
    }

    pub fn id(&self) -> BatcherId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Approximate encoded size of the admitted operations.
    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Admits `op`, or hands it back when the batcher is full.
    ///
    /// A batcher rejects when it already holds `max_count` operations, or
    /// when it is non-empty and `op` would push the running size past
    /// `max_bytes`. An empty batcher always takes one operation, however big.
    pub fn try_add(&mut self, mut op: ItemOperation) -> std::result::Result<(), ItemOperation> {
        if self.operations.len() >= self.max_count {
            return Err(op);
        }

        let length = op.approximate_serialized_length();
        if !self.operations.is_empty() && self.current_bytes + length > self.max_bytes {
            return Err(op);
        }

        op.operation_index = self.operations.len() as u32;
        if let Some(context) = op.context() {
            context.attach_to(self.id);
        }
        self.current_bytes += length;
        self.operations.push(op);
        Ok(())
    }

    /// Sends the batch and resolves or re-batches every operation.
    pub async fn dispatch(self, cancel: &CancellationToken) {
        let Batcher {
            id,
            mut operations,
            max_count,
            max_bytes,
            executor,
            retrier,
            ..
        } = self;

        if operations.is_empty() {
            return;
        }

        let packed = match pack_operations(&operations, max_bytes, max_count, false) {
            Ok(packed) => packed,
            Err(e) => {
                fail_all(id, &operations, e);
                return;
            }
        };

        let overflow = operations.split_off(packed.packed_count);
        if !overflow.is_empty() {
            debug!(
                batcher = id,
                packed = packed.packed_count,
                overflow = overflow.len(),
                "batch overflowed packing"
            );
            for op in overflow {
                retrier.re_batch(op, None).await;
            }
        }

        debug!(
            batcher = id,
            operations = operations.len(),
            bytes = packed.body.len(),
            "dispatching batch"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = executor.execute(packed, cancel) => outcome,
        };

        let results = match outcome {
            Ok(results) => results,
            Err(e) => {
                debug!(batcher = id, error = %e, "batch dispatch failed");
                fail_all(id, &operations, e);
                return;
            }
        };

        // A short or long result list cannot be aligned with the batch.
        if results.len() != operations.len() {
            warn!(
                batcher = id,
                expected = operations.len(),
                received = results.len(),
                "executor returned wrong number of results"
            );
            for op in operations {
                let result = OperationResult::new(StatusCode::INTERNAL_SERVER_ERROR);
                complete_or_retry(id, op, result, &retrier, cancel).await;
            }
            return;
        }

        for (op, result) in operations.into_iter().zip(results) {
            complete_or_retry(id, op, result, &retrier, cancel).await;
        }
    }

    /// Fails every admitted operation with `err` without sending anything.
    pub fn fail_all(self, err: Error) {
        fail_all(self.id, &self.operations, err);
    }
}

fn fail_all(id: BatcherId, operations: &[ItemOperation], err: Error) {
    for op in operations {
        if let Some(context) = op.context() {
            let _ = context.fail(id, err.clone());
        }
    }
}

async fn complete_or_retry(
    id: BatcherId,
    op: ItemOperation,
    result: OperationResult,
    retrier: &Arc<dyn BatchRetrier>,
    cancel: &CancellationToken,
) {
    let Some(context) = op.context().cloned() else {
        return;
    };

    match context.should_retry(&result) {
        ShouldRetry::NoRetry => {
            let _ = context.complete(id, result);
        }
        ShouldRetry::RetryAfter(delay) if delay.is_zero() => {
            warn!(
                batcher = id,
                status = %result.status,
                sub_status = %result.sub_status,
                "re-batching operation"
            );
            retrier.re_batch(op, Some(result)).await;
        }
        ShouldRetry::RetryAfter(delay) => {
            warn!(
                batcher = id,
                status = %result.status,
                delay_ms = delay.as_millis() as u64,
                "retrying operation after back-off"
            );
            spawn_delayed_retry(op, result, delay, Arc::clone(retrier), cancel.clone());
        }
    }
}

fn spawn_delayed_retry(
    op: ItemOperation,
    result: OperationResult,
    delay: Duration,
    retrier: Arc<dyn BatchRetrier>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(context) = op.context() {
                    let _ = context.abort(Error::Cancelled);
                }
            }
            _ = tokio::time::sleep(delay) => {
                retrier.re_batch(op, Some(result)).await;
            }
        }
    });
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::unpack_operations;
    use crate::context::{OperationContext, PendingResult};
    use crate::types::{PartitionKey, RangeId, APPROXIMATE_RECORD_OVERHEAD};
    use parking_lot::Mutex;

    /// Echoes one 200 per packed operation and records request sizes.
    #[derive(Default)]
    struct EchoExecutor {
        requests: Mutex<Vec<usize>>,
        fail_with: Option<Error>,
    }

    #[async_trait]
    impl BatchExecutor for EchoExecutor {
        async fn execute(
            &self,
            batch: PackedBatch,
            _cancel: &CancellationToken,
        ) -> Result<Vec<OperationResult>> {
            self.requests.lock().push(batch.packed_count);
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let ops = unpack_operations(&batch.body)?;
            Ok(ops
                .iter()
                .map(|op| {
                    OperationResult::new(StatusCode::OK)
                        .with_etag(op.id.clone().unwrap_or_default())
                })
                .collect())
        }
    }

    /// Answers every batch with a fixed number of 200s.
    struct FixedCountExecutor {
        count: usize,
    }

    #[async_trait]
    impl BatchExecutor for FixedCountExecutor {
        async fn execute(
            &self,
            _batch: PackedBatch,
            _cancel: &CancellationToken,
        ) -> Result<Vec<OperationResult>> {
            Ok(vec![OperationResult::new(StatusCode::OK); self.count])
        }
    }

    #[derive(Default)]
    struct CollectingRetrier {
        received: Mutex<Vec<(ItemOperation, Option<OperationResult>)>>,
    }

    #[async_trait]
    impl BatchRetrier for CollectingRetrier {
        async fn re_batch(&self, op: ItemOperation, last_result: Option<OperationResult>) {
            self.received.lock().push((op, last_result));
        }
    }

    fn op_with_context(id: &str) -> (ItemOperation, PendingResult) {
        let mut op = ItemOperation::read(id, PartitionKey::from("pk"));
        op.partition_key_json = Some(PartitionKey::from("pk").to_json());
        let (ctx, pending) = OperationContext::new(RangeId::from("0"), None);
        op.attach_context(ctx).unwrap();
        (op, pending)
    }

    fn batcher(
        max_count: usize,
        max_bytes: usize,
    ) -> (Batcher, Arc<EchoExecutor>, Arc<CollectingRetrier>) {
        let executor = Arc::new(EchoExecutor::default());
        let retrier = Arc::new(CollectingRetrier::default());
        let batcher = Batcher::new(max_count, max_bytes, executor.clone(), retrier.clone());
        (batcher, executor, retrier)
    }

    #[test]
    fn test_try_add_count_limit() {
        let (mut batcher, _, _) = batcher(2, usize::MAX);
        assert!(batcher.try_add(op_with_context("a").0).is_ok());
        assert!(batcher.try_add(op_with_context("b").0).is_ok());
        let rejected = batcher.try_add(op_with_context("c").0).unwrap_err();
        assert_eq!(rejected.id.as_deref(), Some("c"));
        assert_eq!(batcher.len(), 2);
    }

    #[test]
    fn test_try_add_byte_limit_allows_singleton() {
        let (mut batcher, _, _) = batcher(10, 1);
        assert!(batcher.try_add(op_with_context("first").0).is_ok());
        assert!(batcher.try_add(op_with_context("second").0).is_err());
        assert!(batcher.current_bytes() > APPROXIMATE_RECORD_OVERHEAD);
    }

    #[test]
    fn test_try_add_assigns_index_and_owner() {
        let (mut batcher, _, _) = batcher(10, usize::MAX);
        let (first, _p1) = op_with_context("a");
        let (second, _p2) = op_with_context("b");
        let ctx = second.context().cloned().unwrap();
        batcher.try_add(first).unwrap();
        batcher.try_add(second).unwrap();

        assert_eq!(batcher.operations[1].operation_index, 1);
        assert_eq!(ctx.current_batcher(), Some(batcher.id()));
    }

    #[tokio::test]
    async fn test_dispatch_completes_every_operation() {
        let (mut batcher, executor, _) = batcher(10, usize::MAX);
        let mut pending = Vec::new();
        for id in ["a", "b", "c"] {
            let (op, p) = op_with_context(id);
            batcher.try_add(op).unwrap();
            pending.push(p);
        }

        batcher.dispatch(&CancellationToken::new()).await;

        for (p, id) in pending.into_iter().zip(["a", "b", "c"]) {
            let result = p.await.unwrap();
            assert_eq!(result.status, StatusCode::OK);
            assert_eq!(result.etag.as_deref(), Some(id));
        }
        assert_eq!(*executor.requests.lock(), vec![3]);
    }

    #[tokio::test]
    async fn test_dispatch_sends_overflow_to_retrier() {
        // Admission estimate lets three in; exact packing only fits two.
        let (mut batcher, executor, retrier) = batcher(2, usize::MAX);
        batcher.max_count = 3;
        let mut pending = Vec::new();
        for id in ["a", "b", "c"] {
            let (op, p) = op_with_context(id);
            batcher.try_add(op).unwrap();
            pending.push(p);
        }
        batcher.max_count = 2;

        batcher.dispatch(&CancellationToken::new()).await;

        assert_eq!(*executor.requests.lock(), vec![2]);
        let received = retrier.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.id.as_deref(), Some("c"));
        assert!(received[0].1.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_error_fails_all() {
        let executor = Arc::new(EchoExecutor {
            fail_with: Some(Error::Transport("connection reset".into())),
            ..Default::default()
        });
        let retrier = Arc::new(CollectingRetrier::default());
        let mut batcher = Batcher::new(10, usize::MAX, executor, retrier);

        let (a, pa) = op_with_context("a");
        let (b, pb) = op_with_context("b");
        batcher.try_add(a).unwrap();
        batcher.try_add(b).unwrap();
        batcher.dispatch(&CancellationToken::new()).await;

        assert_eq!(pa.await, Err(Error::Transport("connection reset".into())));
        assert_eq!(pb.await, Err(Error::Transport("connection reset".into())));
    }

    #[tokio::test]
    async fn test_dispatch_cancelled() {
        let (mut batcher, _, _) = batcher(10, usize::MAX);
        let (op, pending) = op_with_context("a");
        batcher.try_add(op).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        batcher.dispatch(&cancel).await;

        assert_eq!(pending.await, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let (mut batcher, _, _) = batcher(10, usize::MAX);
        let (op, pending) = op_with_context("a");
        batcher.try_add(op).unwrap();
        batcher.fail_all(Error::DispatcherClosed);
        assert_eq!(pending.await, Err(Error::DispatcherClosed));
    }

    #[tokio::test]
    async fn test_result_count_mismatch_fails_whole_batch() {
        for count in [1, 3] {
            let executor = Arc::new(FixedCountExecutor { count });
            let retrier = Arc::new(CollectingRetrier::default());
            let mut batcher = Batcher::new(10, usize::MAX, executor, retrier);

            let (a, pa) = op_with_context("a");
            let (b, pb) = op_with_context("b");
            batcher.try_add(a).unwrap();
            batcher.try_add(b).unwrap();
            batcher.dispatch(&CancellationToken::new()).await;

            for pending in [pa, pb] {
                assert_eq!(
                    pending.await.unwrap().status,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "{} results for 2 operations",
                    count
                );
            }
        }
    }
}
