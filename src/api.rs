//! # Async API for bulkdb
//!
//! [`BulkClient`] is the entry point. It owns the dispatcher registry and
//! hands out cheap [`Container`] handles whose item helpers feed the bulk
//! pipeline:
//!
//! ```text
//!   task1 ─┐                                     ┌─► range "0" streamer ─┐
//!   task2 ─┼─► Container ─► Dispatcher (per ─────┼─► range "1" streamer ─┼─► Transport
//!   task3 ─┘                container, lazy)     └─► range "2" streamer ─┘
//!                 ▲                                         │
//!                 └──────────── PendingResult ◄─────────────┘
//! ```
//!
//! Every helper returns only after the operation's own result arrived, but
//! the operations of many concurrent callers share physical requests.
//!
//! ## Lifetime
//!
//! The client holds a root [`CancellationToken`]. [`BulkClient::shutdown`]
//! cancels it: flush timers stop, in-flight dispatches fail with
//! `Cancelled`, queued operations fail with `DispatcherClosed`, and later
//! calls are refused.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BulkConfig;
use crate::context::PendingResult;
use crate::dispatcher::{Dispatcher, DispatcherParts};
use crate::error::Result;
use crate::registry::DispatcherRegistry;
use crate::retry::{bulk_policy_factory, RetryPolicyFactory};
use crate::transactional::TransactionalBatch;
use crate::transport::{ItemSerializer, JsonSerializer, PartitionRouter, Transport};
use crate::types::{ContainerId, ItemOperation, ItemRequestOptions, OperationResult, PartitionKey};

// =============================================================================
// BulkClient
// =============================================================================

struct ClientShared {
    registry: DispatcherRegistry,
    parts: DispatcherParts,
    cancel: CancellationToken,
}

/// The main async handle for bulk operations.
///
/// # Thread Safety
///
/// `BulkClient` is `Clone`, `Send`, and `Sync`. All clones share the same
/// dispatchers, so operations submitted from different tasks are batched
/// together.
///
/// # Example
///
/// ```rust,ignore
/// use bulkdb::{BulkClient, BulkConfig, MemoryBackend, PartitionKey};
/// use serde_json::json;
///
/// let backend = Arc::new(MemoryBackend::new(4));
/// let client = BulkClient::new(backend.clone(), backend, BulkConfig::default())?;
/// let orders = client.container("orders");
///
/// let cancel = CancellationToken::new();
/// let created = orders
///     .create_item("tenant-1", json!({"id": "o-1", "total": 10}), &cancel)
///     .await?;
/// assert!(created.is_success());
///
/// client.shutdown();
/// ```
#[derive(Clone)]
pub struct BulkClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for BulkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkClient")
            .field("containers", &self.shared.registry.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl BulkClient {
    /// Creates a client with the JSON serializer and the default retry
    /// policy built from `config.retry`.
    ///
    /// # Errors
    ///
    /// `Config` when `config` fails validation.
    pub fn new(
        transport: Arc<dyn Transport>,
        router: Arc<dyn PartitionRouter>,
        config: BulkConfig,
    ) -> Result<Self> {
        let retry_policies = bulk_policy_factory(config.retry.clone());
        Self::from_parts(DispatcherParts {
            config,
            transport,
            router,
            serializer: Arc::new(JsonSerializer),
            retry_policies,
        })
    }

    /// Creates a client from fully specified collaborators.
    pub fn from_parts(parts: DispatcherParts) -> Result<Self> {
        parts.config.validate()?;
        let cancel = CancellationToken::new();
        Ok(Self {
            shared: Arc::new(ClientShared {
                registry: DispatcherRegistry::new(parts.clone(), cancel.clone()),
                parts,
                cancel,
            }),
        })
    }

    /// Replaces the item serializer (builder pattern).
    ///
    /// Only affects dispatchers created afterwards, so call it before the
    /// first container is used.
    pub fn with_serializer(self, serializer: Arc<dyn ItemSerializer>) -> Result<Self> {
        let mut parts = self.shared.parts.clone();
        parts.serializer = serializer;
        Self::from_parts(parts)
    }

    /// Replaces the retry policy factory (builder pattern).
    ///
    /// Same caveat as [`BulkClient::with_serializer`].
    pub fn with_retry_policies(self, retry_policies: RetryPolicyFactory) -> Result<Self> {
        let mut parts = self.shared.parts.clone();
        parts.retry_policies = retry_policies;
        Self::from_parts(parts)
    }

    pub fn config(&self) -> &BulkConfig {
        &self.shared.parts.config
    }

    /// Returns a handle for `id`. No dispatcher is created until first use.
    pub fn container(&self, id: impl Into<ContainerId>) -> Container {
        Container {
            id: id.into(),
            shared: self.shared.clone(),
        }
    }

    /// Closes the container's dispatcher, failing its queued operations.
    ///
    /// A later call through a [`Container`] handle starts a fresh one.
    pub fn close_container(&self, id: &ContainerId) -> bool {
        self.shared.registry.remove(id)
    }

    /// Number of containers with a live dispatcher.
    pub fn active_containers(&self) -> usize {
        self.shared.registry.len()
    }

    /// Stops every dispatcher. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        info!(containers = self.shared.registry.len(), "shutting down bulk client");
        self.shared.registry.close_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

// =============================================================================
// Container
// =============================================================================

/// Item operations on one container.
///
/// Every helper admits the operation into the bulk pipeline and awaits its
/// result. Use [`Container::add`] to submit without waiting.
#[derive(Clone)]
pub struct Container {
    id: ContainerId,
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("id", &self.id).finish()
    }
}

impl Container {
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    fn dispatcher(&self) -> Result<Dispatcher> {
        self.shared.registry.get_or_create(&self.id)
    }

    /// Admits an operation and returns its pending result.
    pub async fn add(
        &self,
        op: ItemOperation,
        options: Option<ItemRequestOptions>,
        cancel: &CancellationToken,
    ) -> Result<PendingResult> {
        self.dispatcher()?.add(op, options, cancel).await
    }

    /// Admits an operation and waits for its result.
    pub async fn execute(
        &self,
        op: ItemOperation,
        options: Option<ItemRequestOptions>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        self.dispatcher()?.execute(op, options, cancel).await
    }

    /// Creates `item`; its id is read from the body by the backend.
    pub async fn create_item(
        &self,
        partition_key: impl Into<PartitionKey>,
        item: Value,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        self.execute(ItemOperation::create(partition_key.into(), item), None, cancel)
            .await
    }

    pub async fn read_item(
        &self,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        self.execute(ItemOperation::read(id, partition_key.into()), None, cancel)
            .await
    }

    pub async fn upsert_item(
        &self,
        partition_key: impl Into<PartitionKey>,
        item: Value,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        self.execute(ItemOperation::upsert(partition_key.into(), item), None, cancel)
            .await
    }

    pub async fn replace_item(
        &self,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        item: Value,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        self.execute(
            ItemOperation::replace(id, partition_key.into(), item),
            None,
            cancel,
        )
        .await
    }

    pub async fn delete_item(
        &self,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        self.execute(ItemOperation::delete(id, partition_key.into()), None, cancel)
            .await
    }

    /// Applies `patch` to item `id`. The backend defines patch semantics.
    pub async fn patch_item(
        &self,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKey>,
        patch: Value,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        self.execute(
            ItemOperation::patch(id, partition_key.into(), patch),
            None,
            cancel,
        )
        .await
    }

    /// Sends partially filled batchers now instead of at the next tick.
    pub fn flush(&self) {
        if let Some(dispatcher) = self.shared.registry.get(&self.id) {
            dispatcher.flush();
        }
    }

    /// Starts an atomic batch on one partition key.
    pub fn transactional_batch(
        &self,
        partition_key: impl Into<PartitionKey>,
    ) -> TransactionalBatch {
        TransactionalBatch::new(
            self.id.clone(),
            partition_key.into(),
            self.shared.parts.transport.clone(),
            self.shared.parts.serializer.clone(),
            &self.shared.parts.config,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
