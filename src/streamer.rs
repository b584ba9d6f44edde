//! # Streamer: Continuous Batching for One Range
//!
//! A [`Streamer`] owns the "current" [`Batcher`] of one partition key range.
//! Callers add operations; whenever the current batcher is full it is swapped
//! for a fresh one and the full one is dispatched in the background.
//!
//! ## Rotation
//!
//! ```text
//!  add(op) ──► lock ──► current.try_add(op)
//!                          │
//!                 ok ◄─────┴─────► rejected (full)
//!                 │                    │
//!              unlock          full = replace(current, Batcher::new())
//!                                  current.try_add(op)
//!                                      │
//!                                   unlock
//!                                      │
//!                              tokio::spawn(full.dispatch())
//! ```
//!
//! Dispatch never runs under the lock, so a slow request cannot stall
//! producers. A periodic timer does the same rotation for batchers that
//! never fill up, so trickling workloads still get sent.
//!
//! ## Shutdown
//!
//! [`Streamer::shutdown`] stops the timer and fails whatever is still sitting
//! in the current batcher with [`Error::DispatcherClosed`]. Requests already
//! in flight are governed by the dispatch cancellation token.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batcher::{BatchExecutor, BatchRetrier, Batcher};
use crate::error::Error;
use crate::types::{ItemOperation, RangeId};

/// Why a batcher was handed off for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Full,
    Timer,
}

impl FlushReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Timer => "timer",
        }
    }
}

struct StreamerState {
    current: Batcher,
    closed: bool,
}

/// Batches operations for one partition key range.
pub struct Streamer {
    range: RangeId,
    max_count: usize,
    max_bytes: usize,
    executor: Arc<dyn BatchExecutor>,
    retrier: Arc<dyn BatchRetrier>,
    state: Mutex<StreamerState>,
    /// Cancels in-flight dispatches (shared with the dispatcher).
    dispatch_cancel: CancellationToken,
    /// Stops this streamer's flush timer.
    timer_cancel: CancellationToken,
}

impl Streamer {
    /// Creates a streamer and starts its flush timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        range: RangeId,
        max_count: usize,
        max_bytes: usize,
        flush_interval: Duration,
        executor: Arc<dyn BatchExecutor>,
        retrier: Arc<dyn BatchRetrier>,
        dispatch_cancel: CancellationToken,
    ) -> Arc<Self> {
        let current = Batcher::new(max_count, max_bytes, executor.clone(), retrier.clone());
        let timer_cancel = dispatch_cancel.child_token();
        let streamer = Arc::new(Self {
            range,
            max_count,
            max_bytes,
            executor,
            retrier,
            state: Mutex::new(StreamerState {
                current,
                closed: false,
            }),
            dispatch_cancel,
            timer_cancel,
        });
        spawn_flush_timer(Arc::downgrade(&streamer), streamer.timer_cancel.clone(), flush_interval);
        streamer
    }

    pub fn range(&self) -> &RangeId {
        &self.range
    }

    /// Number of operations waiting in the current batcher.
    pub fn pending(&self) -> usize {
        self.state.lock().current.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Adds an operation, rotating and dispatching the batcher when full.
    pub fn add(&self, op: ItemOperation) {
        let full = {
            let mut state = self.state.lock();
            if state.closed || self.dispatch_cancel.is_cancelled() {
                drop(state);
                reject(op, Error::DispatcherClosed);
                return;
            }

            match state.current.try_add(op) {
                Ok(()) => None,
                Err(op) => {
                    let full = std::mem::replace(&mut state.current, self.new_batcher());
                    if let Err(op) = state.current.try_add(op) {
                        drop(state);
                        let reason = "operation rejected by an empty batcher";
                        reject(op, Error::InvalidOperation(reason.into()));
                        return self.spawn_dispatch(full, FlushReason::Full);
                    }
                    Some(full)
                }
            }
        };

        if let Some(full) = full {
            self.spawn_dispatch(full, FlushReason::Full);
        }
    }

    /// Dispatches the current batcher if it holds anything.
    pub fn flush(&self) {
        let batcher = {
            let mut state = self.state.lock();
            if state.closed || state.current.is_empty() {
                return;
            }
            std::mem::replace(&mut state.current, self.new_batcher())
        };
        self.spawn_dispatch(batcher, FlushReason::Timer);
    }

    /// Stops the timer and fails pending operations.
    pub fn shutdown(&self) {
        self.timer_cancel.cancel();
        let pending = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::replace(&mut state.current, self.new_batcher())
        };
        if !pending.is_empty() {
            debug!(
                range = %self.range,
                operations = pending.len(),
                "failing pending operations on shutdown"
            );
        }
        pending.fail_all(Error::DispatcherClosed);
    }

    fn new_batcher(&self) -> Batcher {
        Batcher::new(
            self.max_count,
            self.max_bytes,
            self.executor.clone(),
            self.retrier.clone(),
        )
    }

    fn spawn_dispatch(&self, batcher: Batcher, reason: FlushReason) {
        if batcher.is_empty() {
            return;
        }
        debug!(
            range = %self.range,
            batcher = batcher.id(),
            operations = batcher.len(),
            reason = reason.as_str(),
            "rotating batcher"
        );
        let cancel = self.dispatch_cancel.clone();
        tokio::spawn(async move {
            batcher.dispatch(&cancel).await;
        });
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.timer_cancel.cancel();
    }
}

fn reject(op: ItemOperation, err: Error) {
    if let Some(context) = op.context() {
        let _ = context.abort(err);
    }
}

fn spawn_flush_timer(streamer: Weak<Streamer>, cancel: CancellationToken, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(streamer) = streamer.upgrade() else {
                break;
            };
            streamer.flush();
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
