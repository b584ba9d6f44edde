//! # Operation Completion Context
//!
//! An [`OperationContext`] travels with an [`ItemOperation`] through every
//! batcher the operation visits and resolves the caller's future exactly once.
//!
//! ## Ownership Protocol
//!
//! ```text
//!   admit ──► batcher A owns ──► A dispatches ──► 410 ──► re-batch
//!                                                            │
//!                                      batcher B owns ◄──────┘
//!                                            │
//!                                  B dispatches ──► complete(by = B) ✓
//!
//!   complete(by = A) after B took over ──► caller sees WrongBatcher
//! ```
//!
//! A completion from a batcher that is not the current owner means the
//! rotation protocol is broken. The supplied result is discarded and the
//! caller gets [`Error::WrongBatcher`] so the defect is visible.
//!
//! ## Single Resolution
//!
//! The result slot is a `tokio::sync::oneshot` sender behind a mutex, guarded
//! by an atomic `resolved` flag. The first resolution wins; later attempts
//! return [`Error::ContextAlreadyResolved`] and are logged at error level.
//!
//! [`ItemOperation`]: crate::types::ItemOperation

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::error;

use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, ShouldRetry};
use crate::types::{OperationResult, RangeId};

/// Unique identity of a batcher instance.
pub type BatcherId = u64;

type Outcome = Result<OperationResult>;

// =============================================================================
// OperationContext
// =============================================================================

/// Completion tracking for one admitted operation.
pub struct OperationContext {
    range_id: Mutex<RangeId>,
    owner: Mutex<Option<BatcherId>>,
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
    resolved: AtomicBool,
    retry_policy: Option<Box<dyn RetryPolicy>>,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("range_id", &*self.range_id.lock())
            .field("owner", &*self.owner.lock())
            .field("resolved", &self.is_resolved())
            .field("has_retry_policy", &self.retry_policy.is_some())
            .finish()
    }
}

impl OperationContext {
    /// Creates a context and the future its resolution completes.
    pub fn new(
        range_id: RangeId,
        retry_policy: Option<Box<dyn RetryPolicy>>,
    ) -> (Arc<Self>, PendingResult) {
        let (tx, rx) = oneshot::channel();
        let context = Arc::new(Self {
            range_id: Mutex::new(range_id),
            owner: Mutex::new(None),
            sender: Mutex::new(Some(tx)),
            resolved: AtomicBool::new(false),
            retry_policy,
        });
        (context, PendingResult { rx })
    }

    /// Range the operation is currently routed to.
    pub fn range_id(&self) -> RangeId {
        self.range_id.lock().clone()
    }

    /// Updates the range after a re-route.
    pub fn reroute(&self, range_id: RangeId) {
        *self.range_id.lock() = range_id;
    }

    /// Records `batcher` as the current owner.
    pub fn attach_to(&self, batcher: BatcherId) {
        *self.owner.lock() = Some(batcher);
    }

    /// The batcher that currently owns the operation.
    pub fn current_batcher(&self) -> Option<BatcherId> {
        *self.owner.lock()
    }

    /// True once the caller's future has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Asks the operation's retry policy about `result`.
    pub fn should_retry(&self, result: &OperationResult) -> ShouldRetry {
        if result.is_success() {
            return ShouldRetry::NoRetry;
        }
        match &self.retry_policy {
            Some(policy) => policy.should_retry(result),
            None => ShouldRetry::NoRetry,
        }
    }

    /// Resolves with a result on behalf of batcher `by`.
    pub fn complete(&self, by: BatcherId, result: OperationResult) -> Result<()> {
        self.resolve_owned(by, Ok(result))
    }

    /// Resolves with an error on behalf of batcher `by`.
    pub fn fail(&self, by: BatcherId, err: Error) -> Result<()> {
        self.resolve_owned(by, Err(err))
    }

    /// Resolves with an error outside of any batcher.
    ///
    /// Used when the operation is between batchers (re-route failures,
    /// shutdown while a retry is pending).
    pub fn abort(&self, err: Error) -> Result<()> {
        self.deliver(Err(err))
    }

    fn resolve_owned(&self, by: BatcherId, outcome: Outcome) -> Result<()> {
        let owner = self.current_batcher();
        if owner != Some(by) {
            let defect = Error::WrongBatcher {
                owner,
                completer: by,
            };
            error!(?owner, completer = by, "operation completed by a batcher that does not own it");
            self.deliver(Err(defect.clone()))?;
            return Err(defect);
        }
        self.deliver(outcome)
    }

    fn deliver(&self, outcome: Outcome) -> Result<()> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            error!(range = %self.range_id(), "operation context resolved twice");
            return Err(Error::ContextAlreadyResolved);
        }
        if let Some(tx) = self.sender.lock().take() {
            // The caller may have dropped its future; that is not an error.
            let _ = tx.send(outcome);
        }
        Ok(())
    }
}

// =============================================================================
// PendingResult
// =============================================================================

/// Future returned by `Dispatcher::add`; resolves exactly once.
///
/// Resolves to [`Error::OperationAbandoned`] if the context is dropped
/// without being resolved.
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for PendingResult {
    type Output = Result<OperationResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::OperationAbandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
