//! # In-Memory Partitioned Backend
//!
//! [`MemoryBackend`] implements both [`Transport`] and [`PartitionRouter`]
//! against a `HashMap` item store. It exists for tests and for the
//! `stress_test` load generator, but it speaks the real record-stream codec
//! so the whole client pipeline is exercised end to end.
//!
//! ## Ranges
//!
//! The keyspace is the XXH3-64 hash of the routing key (partition key json),
//! divided into contiguous ranges:
//!
//! ```text
//! 0                                                          u64::MAX
//! ├──────────── "0" ────────────┼──────────── "1" ────────────┤
//!
//! split_range("1"):
//! ├──────────── "0" ────────────┼───── "2" ─────┼───── "3" ────┤
//!                                  ("1" is retired: requests get 410/1002)
//! ```
//!
//! Ranges are shared by all containers.
//!
//! ## Fault Injection
//!
//! [`MemoryBackend::inject_fault`] queues a [`Fault`] that replaces the
//! response to the next request. Faults are consumed in order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{encode_results, unpack_operations};
use crate::error::{Error, Result};
use crate::transport::{
    BatchHeaders, PartitionRouter, RequestTarget, Transport, WireRequest, WireResponse,
};
use crate::types::{
    round_charge, ContainerId, ItemOperation, OperationKind, OperationResult, PartitionKey,
    RangeId, Resource, StatusCode, SubStatusCode,
};

const READ_CHARGE: f64 = 1.0;
const WRITE_CHARGE: f64 = 5.71;

// =============================================================================
// Public Types
// =============================================================================

/// A canned failure for the next request.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// 429 for the whole request, with a retry-after hint.
    Throttle { retry_after: Duration },
    /// Any request-level status with a non-record body.
    Status {
        status: StatusCode,
        sub_status: SubStatusCode,
    },
    /// 200 with a body that is not a record stream.
    MalformedBody,
    /// Applies the request but drops the last result from the response.
    MissingResult,
    /// No response at all.
    TransportError(String),
}

/// What the backend saw of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub container: ContainerId,
    pub target: RequestTarget,
    pub headers: BatchHeaders,
    pub operation_count: usize,
    pub body_len: usize,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone)]
struct RangeEntry {
    id: RangeId,
    start: u64,
    end: u64,
}

#[derive(Debug, Clone)]
struct StoredItem {
    body: Value,
    etag: String,
}

type ItemKey = (ContainerId, String, String);

#[derive(Debug, Default)]
struct BackendState {
    ranges: Vec<RangeEntry>,
    retired: HashSet<RangeId>,
    next_range: u64,
    items: HashMap<ItemKey, StoredItem>,
    etag_seq: u64,
}

impl BackendState {
    fn range_for(&self, key: &str) -> RangeId {
        let hash = xxhash_rust::xxh3::xxh3_64(key.as_bytes());
        self.ranges
            .iter()
            .find(|r| r.start <= hash && hash <= r.end)
            .map(|r| r.id.clone())
            // Ranges always cover the full keyspace.
            .unwrap_or_else(|| RangeId::from("0"))
    }

    fn is_live(&self, range: &RangeId) -> bool {
        self.ranges.iter().any(|r| &r.id == range)
    }
}

/// Writes staged on top of the committed store.
struct Staged<'a> {
    base: &'a HashMap<ItemKey, StoredItem>,
    overlay: HashMap<ItemKey, Option<StoredItem>>,
}

impl<'a> Staged<'a> {
    fn new(base: &'a HashMap<ItemKey, StoredItem>) -> Self {
        Self {
            base,
            overlay: HashMap::new(),
        }
    }

    fn get(&self, key: &ItemKey) -> Option<StoredItem> {
        match self.overlay.get(key) {
            Some(staged) => staged.clone(),
            None => self.base.get(key).cloned(),
        }
    }

    fn put(&mut self, key: ItemKey, item: StoredItem) {
        self.overlay.insert(key, Some(item));
    }

    fn remove(&mut self, key: ItemKey) {
        self.overlay.insert(key, None);
    }
}

fn commit(items: &mut HashMap<ItemKey, StoredItem>, overlay: HashMap<ItemKey, Option<StoredItem>>) {
    for (key, value) in overlay {
        match value {
            Some(item) => {
                items.insert(key, item);
            }
            None => {
                items.remove(&key);
            }
        }
    }
}

// =============================================================================
// MemoryBackend
// =============================================================================

/// In-memory implementation of [`Transport`] and [`PartitionRouter`].
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    faults: Mutex<VecDeque<Fault>>,
    requests: Mutex<Vec<RecordedRequest>>,
    routing_refreshes: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryBackend {
    /// Creates a backend whose keyspace is split into `range_count` ranges.
    pub fn new(range_count: usize) -> Self {
        let count = range_count.max(1) as u64;
        let width = u64::MAX / count;
        let ranges = (0..count)
            .map(|i| RangeEntry {
                id: RangeId::from(i.to_string()),
                start: i * width,
                end: if i + 1 == count {
                    u64::MAX
                } else {
                    (i + 1) * width - 1
                },
            })
            .collect();

        Self {
            state: Mutex::new(BackendState {
                ranges,
                next_range: count,
                ..Default::default()
            }),
            faults: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            routing_refreshes: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Delays every response (builder pattern).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Live ranges, in keyspace order.
    pub fn ranges(&self) -> Vec<RangeId> {
        self.state.lock().ranges.iter().map(|r| r.id.clone()).collect()
    }

    /// Range currently owning a routing key.
    pub fn range_for(&self, routing_key: &str) -> RangeId {
        self.state.lock().range_for(routing_key)
    }

    /// Splits `range` in two and retires it.
    pub fn split_range(&self, range: &RangeId) -> Result<(RangeId, RangeId)> {
        let mut state = self.state.lock();
        let position = state
            .ranges
            .iter()
            .position(|r| &r.id == range)
            .ok_or_else(|| Error::Routing(format!("unknown range {}", range)))?;
        let old = state.ranges[position].clone();
        if old.start == old.end {
            return Err(Error::Routing(format!("range {} cannot be split", range)));
        }

        let mid = old.start + (old.end - old.start) / 2;
        let left = RangeId::from(state.next_range.to_string());
        let right = RangeId::from((state.next_range + 1).to_string());
        state.next_range += 2;

        state.ranges.splice(
            position..=position,
            [
                RangeEntry {
                    id: left.clone(),
                    start: old.start,
                    end: mid,
                },
                RangeEntry {
                    id: right.clone(),
                    start: mid + 1,
                    end: old.end,
                },
            ],
        );
        state.retired.insert(old.id);
        Ok((left, right))
    }

    /// Queues a fault for the next request.
    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// How many times a client asked for a routing refresh.
    pub fn routing_refreshes(&self) -> usize {
        self.routing_refreshes.load(Ordering::Relaxed)
    }

    /// Current body of an item, if it exists.
    pub fn item(
        &self,
        container: &ContainerId,
        partition_key: &PartitionKey,
        id: &str,
    ) -> Option<Value> {
        let key = (container.clone(), partition_key.to_json(), id.to_string());
        self.state.lock().items.get(&key).map(|i| i.body.clone())
    }

    /// Number of stored items across all containers.
    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }

    fn execute(
        &self,
        request: &WireRequest,
        ops: &[ItemOperation],
    ) -> (StatusCode, Vec<OperationResult>) {
        let mut state = self.state.lock();

        match &request.target {
            RequestTarget::Range(range) => {
                if !state.is_live(range) {
                    return (StatusCode::GONE, Vec::new());
                }

                let mut results = Vec::with_capacity(ops.len());
                for op in ops {
                    let pk = op.partition_key_json.clone().unwrap_or_default();
                    if op.partition_key_json.is_some() && &state.range_for(&pk) != range {
                        results.push(
                            OperationResult::new(StatusCode::GONE)
                                .with_sub_status(SubStatusCode::PARTITION_KEY_RANGE_GONE),
                        );
                        continue;
                    }

                    let BackendState { items, etag_seq, .. } = &mut *state;
                    let (result, overlay) = {
                        let mut staged = Staged::new(items);
                        let result = apply(&mut staged, etag_seq, &request.container, &pk, op);
                        (result, staged.overlay)
                    };
                    if result.is_success() {
                        commit(items, overlay);
                    }
                    results.push(result);
                }

                let status = if results.iter().all(|r| r.is_success()) {
                    StatusCode::OK
                } else {
                    StatusCode::MULTI_STATUS
                };
                (status, results)
            }
            RequestTarget::PartitionKey(pk) => {
                let BackendState { items, etag_seq, .. } = &mut *state;
                let mut results = Vec::with_capacity(ops.len());
                let mut failed: Option<StatusCode> = None;
                let overlay = {
                    let mut staged = Staged::new(items);
                    for op in ops {
                        let result = apply(&mut staged, etag_seq, &request.container, pk, op);
                        let is_error = result.status.is_error();
                        results.push(result);
                        if is_error {
                            failed = Some(results[results.len() - 1].status);
                            break;
                        }
                    }
                    staged.overlay
                };

                match failed {
                    None => {
                        commit(items, overlay);
                        (StatusCode::OK, results)
                    }
                    Some(status) => {
                        let failed_index = results.len() - 1;
                        let results: Vec<OperationResult> = (0..ops.len())
                            .map(|i| {
                                if i == failed_index {
                                    results[i].clone()
                                } else {
                                    OperationResult::new(StatusCode::FAILED_DEPENDENCY)
                                }
                            })
                            .collect();
                        (status, results)
                    }
                }
            }
        }
    }
}

// =============================================================================
// Item Semantics
// =============================================================================

fn next_etag(seq: &mut u64) -> String {
    *seq += 1;
    format!("\"{:08x}\"", *seq)
}

fn parse_body(op: &ItemOperation) -> std::result::Result<Value, OperationResult> {
    match &op.resource {
        Resource::Raw(bytes) => serde_json::from_slice(bytes)
            .map_err(|_| OperationResult::new(StatusCode::BAD_REQUEST)),
        Resource::Value(value) => Ok(value.clone()),
        Resource::Empty => Err(OperationResult::new(StatusCode::BAD_REQUEST)),
    }
}

fn body_id(body: &Value) -> Option<String> {
    body.get("id").and_then(Value::as_str).map(str::to_owned)
}

fn write_result(status: StatusCode, item: &StoredItem, op: &ItemOperation) -> OperationResult {
    let minimal = op
        .options
        .as_ref()
        .and_then(|o| o.minimal_response)
        .unwrap_or(false);
    let mut result = OperationResult::new(status)
        .with_etag(item.etag.clone())
        .with_request_charge(WRITE_CHARGE);
    if !minimal {
        result = result.with_body(Bytes::from(item.body.to_string()));
    }
    result
}

fn if_match_fails(op: &ItemOperation, existing: &StoredItem) -> bool {
    op.options
        .as_ref()
        .and_then(|o| o.if_match_etag.as_deref())
        .is_some_and(|etag| etag != existing.etag)
}

fn apply_patch(target: &mut Value, patch: &Value) -> bool {
    let Some(object) = target.as_object_mut() else {
        return false;
    };
    match patch {
        Value::Object(fields) => {
            for (k, v) in fields {
                object.insert(k.clone(), v.clone());
            }
            true
        }
        Value::Array(ops) => {
            for op in ops {
                let path = op.get("path").and_then(Value::as_str).unwrap_or("");
                let Some(field) = path.strip_prefix('/') else {
                    return false;
                };
                match op.get("op").and_then(Value::as_str) {
                    Some("add") | Some("set") | Some("replace") => {
                        let value = op.get("value").cloned().unwrap_or(Value::Null);
                        object.insert(field.to_string(), value);
                    }
                    Some("remove") => {
                        object.remove(field);
                    }
                    _ => return false,
                }
            }
            true
        }
        _ => false,
    }
}

fn apply(
    store: &mut Staged<'_>,
    etag_seq: &mut u64,
    container: &ContainerId,
    pk: &str,
    op: &ItemOperation,
) -> OperationResult {
    let key_for = |id: String| (container.clone(), pk.to_string(), id);

    match op.kind {
        OperationKind::Create | OperationKind::Upsert => {
            let body = match parse_body(op) {
                Ok(body) => body,
                Err(result) => return result,
            };
            let Some(id) = body_id(&body) else {
                return OperationResult::new(StatusCode::BAD_REQUEST);
            };
            let key = key_for(id);
            let existing = store.get(&key);
            let status = match (&existing, op.kind) {
                (Some(_), OperationKind::Create) => {
                    return OperationResult::new(StatusCode::CONFLICT)
                        .with_request_charge(READ_CHARGE);
                }
                (Some(item), _) if if_match_fails(op, item) => {
                    return OperationResult::new(StatusCode::PRECONDITION_FAILED)
                }
                (Some(_), _) => StatusCode::OK,
                (None, _) => StatusCode::CREATED,
            };
            let item = StoredItem {
                body,
                etag: next_etag(etag_seq),
            };
            let result = write_result(status, &item, op);
            store.put(key, item);
            result
        }
        OperationKind::Read => {
            let key = key_for(op.id.clone().unwrap_or_default());
            match store.get(&key) {
                Some(item) => {
                    let not_modified = op
                        .options
                        .as_ref()
                        .and_then(|o| o.if_none_match_etag.as_deref())
                        .is_some_and(|etag| etag == item.etag);
                    if not_modified {
                        return OperationResult::new(StatusCode::NOT_MODIFIED)
                            .with_etag(item.etag)
                            .with_request_charge(READ_CHARGE);
                    }
                    OperationResult::new(StatusCode::OK)
                        .with_etag(item.etag.clone())
                        .with_body(Bytes::from(item.body.to_string()))
                        .with_request_charge(READ_CHARGE)
                }
                None => {
                    OperationResult::new(StatusCode::NOT_FOUND).with_request_charge(READ_CHARGE)
                }
            }
        }
        OperationKind::Replace | OperationKind::Patch => {
            let key = key_for(op.id.clone().unwrap_or_default());
            let Some(existing) = store.get(&key) else {
                return OperationResult::new(StatusCode::NOT_FOUND).with_request_charge(READ_CHARGE);
            };
            if if_match_fails(op, &existing) {
                return OperationResult::new(StatusCode::PRECONDITION_FAILED);
            }
            let patch = match parse_body(op) {
                Ok(body) => body,
                Err(result) => return result,
            };
            let body = if op.kind == OperationKind::Replace {
                patch
            } else {
                let mut body = existing.body.clone();
                if !apply_patch(&mut body, &patch) {
                    return OperationResult::new(StatusCode::BAD_REQUEST);
                }
                body
            };
            let item = StoredItem {
                body,
                etag: next_etag(etag_seq),
            };
            let result = write_result(StatusCode::OK, &item, op);
            store.put(key, item);
            result
        }
        OperationKind::Delete => {
            let key = key_for(op.id.clone().unwrap_or_default());
            match store.get(&key) {
                Some(existing) if if_match_fails(op, &existing) => {
                    OperationResult::new(StatusCode::PRECONDITION_FAILED)
                }
                Some(_) => {
                    store.remove(key);
                    OperationResult::new(StatusCode::NO_CONTENT).with_request_charge(WRITE_CHARGE)
                }
                None => {
                    OperationResult::new(StatusCode::NOT_FOUND).with_request_charge(READ_CHARGE)
                }
            }
        }
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

#[async_trait]
impl Transport for MemoryBackend {
    async fn send(&self, request: WireRequest, cancel: &CancellationToken) -> Result<WireResponse> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.requests.lock().push(RecordedRequest {
            container: request.container.clone(),
            target: request.target.clone(),
            headers: request.headers,
            operation_count: request.operation_count,
            body_len: request.body.len(),
        });

        if let Some(latency) = self.latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        let activity_id = Uuid::new_v4().to_string();
        let fault = self.faults.lock().pop_front();
        let mut drop_last = false;
        match fault {
            Some(Fault::Throttle { retry_after }) => {
                return Ok(WireResponse::new(StatusCode::TOO_MANY_REQUESTS, "request rate is large")
                    .with_retry_after(retry_after)
                    .with_activity_id(activity_id));
            }
            Some(Fault::Status { status, sub_status }) => {
                return Ok(WireResponse::new(status, "injected failure")
                    .with_sub_status(sub_status)
                    .with_activity_id(activity_id));
            }
            Some(Fault::MalformedBody) => {
                return Ok(WireResponse::new(StatusCode::OK, vec![0xde, 0xad, 0xbe, 0xef])
                    .with_activity_id(activity_id));
            }
            Some(Fault::TransportError(message)) => return Err(Error::Transport(message)),
            Some(Fault::MissingResult) => drop_last = true,
            None => {}
        }

        let ops = match unpack_operations(&request.body) {
            Ok(ops) => ops,
            Err(e) => {
                return Ok(WireResponse::new(StatusCode::BAD_REQUEST, e.to_string())
                    .with_activity_id(activity_id))
            }
        };

        let (status, mut results) = self.execute(&request, &ops);
        if status == StatusCode::GONE && results.is_empty() {
            return Ok(WireResponse::new(StatusCode::GONE, "partition key range is gone")
                .with_sub_status(SubStatusCode::PARTITION_KEY_RANGE_GONE)
                .with_activity_id(activity_id));
        }
        if drop_last {
            results.pop();
        }

        let charge = round_charge(results.iter().map(|r| r.request_charge).sum());
        Ok(WireResponse::new(status, encode_results(&results))
            .with_request_charge(charge)
            .with_activity_id(activity_id))
    }
}

#[async_trait]
impl PartitionRouter for MemoryBackend {
    async fn resolve_range(
        &self,
        _container: &ContainerId,
        partition_key_json: &str,
    ) -> Result<RangeId> {
        Ok(self.range_for(partition_key_json))
    }

    async fn routing_changed(&self, _container: &ContainerId, range: &RangeId) -> Result<bool> {
        self.routing_refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.lock().retired.contains(range))
    }
}

// =============================================================================
// Tests
// =============================================================================
