//! # Transactional Batch
//!
//! A [`TransactionalBatch`] is an explicit, all-or-nothing group of
//! operations on a single logical partition. Unlike the bulk path it is not
//! streamed: the whole batch must fit in one request, is sent once, and the
//! backend either applies every operation or none.
//!
//! ## Compared to Bulk
//!
//! | | bulk (`Dispatcher`) | transactional |
//! |---|---|---|
//! | scope | any partition key | one partition key |
//! | requests | as many as needed | exactly one |
//! | atomic | no | yes |
//! | retries | per operation | none (caller decides) |
//!
//! The response uses the same record-stream codec. When one operation fails
//! the backend reports its status for that operation and 424 (failed
//! dependency) for the others.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut batch = container.transactional_batch(PartitionKey::from("order-1"));
//! batch
//!     .create(json!({"id": "header", "total": 10}))
//!     .replace("line-1", json!({"id": "line-1", "qty": 2}));
//! let response = batch.execute(None, &cancel).await?;
//! assert!(response.is_success());
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{pack_operations, BatchResponse};
use crate::config::BulkConfig;
use crate::error::{Error, Result};
use crate::transport::{BatchHeaders, ItemSerializer, RequestTarget, Transport, WireRequest};
use crate::types::{
    ContainerId, ItemOperation, ItemRequestOptions, OperationKind, OperationResult, PartitionKey,
    Resource, StatusCode, SubStatusCode,
};

// =============================================================================
// Builder
// =============================================================================

/// Builder for an atomic batch on one partition key.
pub struct TransactionalBatch {
    container: ContainerId,
    partition_key: PartitionKey,
    operations: Vec<ItemOperation>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn ItemSerializer>,
    max_count: usize,
    max_bytes: usize,
}

impl TransactionalBatch {
    pub fn new(
        container: ContainerId,
        partition_key: PartitionKey,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn ItemSerializer>,
        config: &BulkConfig,
    ) -> Self {
        Self {
            container,
            partition_key,
            operations: Vec::new(),
            transport,
            serializer,
            max_count: config.max_operations_per_request,
            max_bytes: config.max_request_body_bytes,
        }
    }

    /// Adds a create of `item`.
    pub fn create(&mut self, item: Value) -> &mut Self {
        self.push(OperationKind::Create, None, Resource::Value(item))
    }

    /// Adds a read of item `id`.
    pub fn read(&mut self, id: impl Into<String>) -> &mut Self {
        self.push(OperationKind::Read, Some(id.into()), Resource::Empty)
    }

    /// Adds an upsert of `item`.
    pub fn upsert(&mut self, item: Value) -> &mut Self {
        self.push(OperationKind::Upsert, None, Resource::Value(item))
    }

    /// Adds a replace of item `id`.
    pub fn replace(&mut self, id: impl Into<String>, item: Value) -> &mut Self {
        self.push(OperationKind::Replace, Some(id.into()), Resource::Value(item))
    }

    /// Adds a delete of item `id`.
    pub fn delete(&mut self, id: impl Into<String>) -> &mut Self {
        self.push(OperationKind::Delete, Some(id.into()), Resource::Empty)
    }

    /// Adds a patch of item `id`.
    pub fn patch(&mut self, id: impl Into<String>, patch: Value) -> &mut Self {
        self.push(OperationKind::Patch, Some(id.into()), Resource::Value(patch))
    }

    /// Sets per-item options on the most recently added operation.
    pub fn with_item_options(&mut self, options: ItemRequestOptions) -> &mut Self {
        if let Some(last) = self.operations.last_mut() {
            last.options = Some(options);
        }
        self
    }

    /// Adds a fully built operation. Its partition key is replaced by the
    /// batch's.
    pub fn add_operation(&mut self, mut op: ItemOperation) -> &mut Self {
        op.partition_key = Some(self.partition_key.clone());
        op.operation_index = self.operations.len() as u32;
        self.operations.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn push(&mut self, kind: OperationKind, id: Option<String>, resource: Resource) -> &mut Self {
        let op = ItemOperation::new(kind, id, Some(self.partition_key.clone()), resource);
        self.add_operation(op)
    }

    /// Sends the batch as one atomic request.
    ///
    /// # Errors
    ///
    /// - `InvalidBatch` when the batch is empty
    /// - `UnsupportedOption` for batch-level if-match / if-none-match
    /// - `InvalidOperation` for bad effective-partition-key pairing
    /// - `BatchTooLarge` when the operations do not fit one request
    /// - `Cancelled` / `Transport` from the exchange
    pub async fn execute(
        self,
        options: Option<ItemRequestOptions>,
        cancel: &CancellationToken,
    ) -> Result<TransactionalBatchResponse> {
        if self.operations.is_empty() {
            return Err(Error::InvalidBatch(
                "transactional batch must contain at least one operation".into(),
            ));
        }
        if let Some(options) = &options {
            if options.if_match_etag.is_some() || options.if_none_match_etag.is_some() {
                return Err(Error::UnsupportedOption(
                    "if-match and if-none-match are only supported per operation in a batch"
                        .into(),
                ));
            }
        }

        let partition_key_json = self.partition_key.to_json();
        let mut operations = self.operations;
        for op in &mut operations {
            if let Some(item_options) = &op.options {
                item_options.validate_effective_partition_key(false)?;
            }
            if let Resource::Value(value) = &op.resource {
                op.resource = Resource::Raw(self.serializer.to_bytes(value)?);
            }
            op.partition_key_json = Some(partition_key_json.clone());
        }

        let total = operations.len();
        let packed = pack_operations(&operations, self.max_bytes, self.max_count, true)?;
        if packed.packed_count < total {
            return Err(Error::BatchTooLarge {
                packed: packed.packed_count,
                total,
            });
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let request = WireRequest {
            container: self.container.clone(),
            target: RequestTarget::PartitionKey(partition_key_json),
            headers: BatchHeaders::transactional(),
            operation_count: total,
            body: packed.body,
        };
        let wire = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            wire = self.transport.send(request, cancel) => wire?,
        };
        debug!(
            container = %self.container,
            status = %wire.status,
            operations = total,
            "transactional batch response"
        );

        Ok(BatchResponse::from_wire(wire, total).into())
    }
}

// =============================================================================
// Response
// =============================================================================

/// Outcome of a transactional batch.
#[derive(Debug, Clone)]
pub struct TransactionalBatchResponse {
    pub status: StatusCode,
    pub sub_status: SubStatusCode,
    pub request_charge: f64,
    pub retry_after: Option<Duration>,
    pub activity_id: String,
    results: Vec<OperationResult>,
}

impl From<BatchResponse> for TransactionalBatchResponse {
    fn from(response: BatchResponse) -> Self {
        Self {
            status: response.status,
            sub_status: response.sub_status,
            request_charge: response.request_charge,
            retry_after: response.retry_after,
            activity_id: response.activity_id,
            results: response.results,
        }
    }
}

impl TransactionalBatchResponse {
    /// True when every operation was applied.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Number of operation results (equals the number of operations sent).
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result of the operation at `index`.
    pub fn get(&self, index: usize) -> Option<&OperationResult> {
        self.results.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.iter()
    }

    pub fn into_results(self) -> Vec<OperationResult> {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::transport::JsonSerializer;
    use serde_json::json;

    fn batch(backend: &Arc<MemoryBackend>, pk: &str) -> TransactionalBatch {
        TransactionalBatch::new(
            ContainerId::from("orders"),
            PartitionKey::from(pk),
            backend.clone(),
            Arc::new(JsonSerializer),
            &BulkConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let backend = Arc::new(MemoryBackend::new(1));
        let err = batch(&backend, "p")
            .execute(None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBatch(_)));
    }

    #[tokio::test]
    async fn test_batch_level_etag_rejected() {
        let backend = Arc::new(MemoryBackend::new(1));
        let mut b = batch(&backend, "p");
        b.create(json!({"id": "a"}));
        let options = ItemRequestOptions {
            if_match_etag: Some("e".into()),
            ..Default::default()
        };
        let err = b.execute(Some(options), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOption(_)));
    }

    #[tokio::test]
    async fn test_too_large_rejected() {
        let backend = Arc::new(MemoryBackend::new(1));
        let mut b = TransactionalBatch::new(
            ContainerId::from("orders"),
            PartitionKey::from("p"),
            backend.clone(),
            Arc::new(JsonSerializer),
            &BulkConfig::default().with_request_limits(2, 1_000_000),
        );
        b.create(json!({"id": "a"}))
            .create(json!({"id": "b"}))
            .create(json!({"id": "c"}));
        let err = b.execute(None, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, Error::BatchTooLarge { packed: 2, total: 3 });
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_atomic_success_and_headers() {
        let backend = Arc::new(MemoryBackend::new(1));
        let mut b = batch(&backend, "p");
        b.create(json!({"id": "a"})).create(json!({"id": "b"})).read("a");
        let response = b.execute(None, &CancellationToken::new()).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.len(), 3);
        assert_eq!(response.get(2).unwrap().status, StatusCode::OK);

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].headers, BatchHeaders::transactional());
        assert_eq!(
            requests[0].target,
            RequestTarget::PartitionKey(r#"["p"]"#.to_string())
        );
    }
}
