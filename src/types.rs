//! # Domain Types for bulkdb
//!
//! This module defines the core types that flow through the bulk pipeline:
//! identifiers, status codes, partition keys, item operations and their
//! per-operation results.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Container ids and range ids are both strings on the wire, and status and
//! sub-status codes are both integers. Wrapping each in its own newtype means
//! a `RangeId` can never be passed where a `ContainerId` is expected, and a
//! sub-status can never be compared against a status constant by accident.
//!
//! ## Example
//!
//! ```rust
//! use bulkdb::types::{ItemOperation, PartitionKey, StatusCode};
//! use serde_json::json;
//!
//! let op = ItemOperation::create(PartitionKey::from("tenant-1"), json!({"id": "a"}));
//! assert!(op.id.is_none());
//! assert!(StatusCode::CREATED.is_success());
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::OperationContext;
use crate::error::{Error, Result};

/// Flat per-record allowance added to the approximate serialized length.
///
/// Only used for the admission-time estimate in the batcher. The codec's
/// pack-time accounting is exact, so this value is a tuning knob and not
/// load-bearing for correctness.
pub const APPROXIMATE_RECORD_OVERHEAD: usize = 32;

// =============================================================================
// Identifiers
// =============================================================================

/// Identity of a container (collection) that owns a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContainerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of a partition key range.
///
/// # What is a Range?
///
/// A contiguous slice of the keyspace owned by one backend node at a given
/// time. Ranges split and merge, so the range a key maps to can change while
/// an operation is queued. Range ids are never reused after a split.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeId(String);

impl RangeId {
    /// Creates a range id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RangeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RangeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Status Codes
// =============================================================================

/// HTTP-style status code of an operation or a whole wire response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const MULTI_STATUS: StatusCode = StatusCode(207);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const CONFLICT: StatusCode = StatusCode(409);
    pub const GONE: StatusCode = StatusCode(410);
    pub const PRECONDITION_FAILED: StatusCode = StatusCode(412);
    pub const REQUEST_ENTITY_TOO_LARGE: StatusCode = StatusCode(413);
    pub const FAILED_DEPENDENCY: StatusCode = StatusCode(424);
    pub const TOO_MANY_REQUESTS: StatusCode = StatusCode(429);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    /// Creates a status code from its numeric value.
    pub const fn from_raw(value: u16) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    pub const fn as_raw(&self) -> u16 {
        self.0
    }

    /// True for 2xx codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// True for 4xx and 5xx codes.
    pub fn is_error(&self) -> bool {
        self.0 >= 400
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-specific refinement of a [`StatusCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubStatusCode(u32);

impl SubStatusCode {
    pub const UNKNOWN: SubStatusCode = SubStatusCode(0);
    pub const NAME_CACHE_IS_STALE: SubStatusCode = SubStatusCode(1000);
    pub const PARTITION_KEY_RANGE_GONE: SubStatusCode = SubStatusCode(1002);
    pub const COMPLETING_SPLIT: SubStatusCode = SubStatusCode(1007);
    pub const COMPLETING_PARTITION_MIGRATION: SubStatusCode = SubStatusCode(1008);
    pub const RESPONSE_SIZE_EXCEEDED: SubStatusCode = SubStatusCode(3402);

    /// Creates a sub-status code from its numeric value.
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns true when `(status, sub_status)` says the operation's range moved.
///
/// These are the "gone" family signals: the range was split, is completing a
/// split or a migration, or the client's name cache is stale. Operations that
/// see them are re-routed instead of completed.
pub fn is_partition_moved(status: StatusCode, sub_status: SubStatusCode) -> bool {
    status == StatusCode::GONE
        && matches!(
            sub_status,
            SubStatusCode::PARTITION_KEY_RANGE_GONE
                | SubStatusCode::COMPLETING_SPLIT
                | SubStatusCode::COMPLETING_PARTITION_MIGRATION
                | SubStatusCode::NAME_CACHE_IS_STALE
        )
}

// =============================================================================
// Operation Kinds
// =============================================================================

/// The item action an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Read,
    Upsert,
    Replace,
    Delete,
    Patch,
}

impl OperationKind {
    /// Wire code written into the record stream.
    pub fn code(&self) -> i32 {
        match self {
            OperationKind::Create => 0,
            OperationKind::Patch => 1,
            OperationKind::Read => 2,
            OperationKind::Delete => 4,
            OperationKind::Replace => 5,
            OperationKind::Upsert => 20,
        }
    }

    /// Parses a wire code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(OperationKind::Create),
            1 => Some(OperationKind::Patch),
            2 => Some(OperationKind::Read),
            4 => Some(OperationKind::Delete),
            5 => Some(OperationKind::Replace),
            20 => Some(OperationKind::Upsert),
            _ => None,
        }
    }

    /// True when the operation addresses an existing item by id.
    pub fn requires_id(&self) -> bool {
        matches!(
            self,
            OperationKind::Read
                | OperationKind::Replace
                | OperationKind::Delete
                | OperationKind::Patch
        )
    }

    /// True when the operation carries a resource body.
    pub fn has_body(&self) -> bool {
        matches!(
            self,
            OperationKind::Create
                | OperationKind::Upsert
                | OperationKind::Replace
                | OperationKind::Patch
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Upsert => "upsert",
            OperationKind::Replace => "replace",
            OperationKind::Delete => "delete",
            OperationKind::Patch => "patch",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Partition Keys
// =============================================================================

/// A logical partition key value.
///
/// The wire form is a JSON array with one component, e.g. `["tenant-1"]`.
/// `None` addresses items written without a partition key and is encoded as
/// `[{}]`; `Null` is an explicit JSON null key, `[null]`.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionKey {
    None,
    Null,
    Value(Value),
}

impl PartitionKey {
    /// Returns the JSON string sent on the wire and used for routing.
    pub fn to_json(&self) -> String {
        match self {
            PartitionKey::None => "[{}]".to_string(),
            PartitionKey::Null => "[null]".to_string(),
            PartitionKey::Value(v) => Value::Array(vec![v.clone()]).to_string(),
        }
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        PartitionKey::Value(Value::String(s.to_string()))
    }
}

impl From<String> for PartitionKey {
    fn from(s: String) -> Self {
        PartitionKey::Value(Value::String(s))
    }
}

impl From<i64> for PartitionKey {
    fn from(n: i64) -> Self {
        PartitionKey::Value(Value::from(n))
    }
}

impl From<bool> for PartitionKey {
    fn from(b: bool) -> Self {
        PartitionKey::Value(Value::Bool(b))
    }
}

// =============================================================================
// Request Options
// =============================================================================

/// Consistency levels a caller may try to override per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    ConsistentPrefix,
    Eventual,
}

/// Per-operation request options.
///
/// Only the first group of fields is honoured inside a bulk batch. The second
/// group exists so that options built for single-item calls can be passed in
/// and rejected with a clear error instead of being silently ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemRequestOptions {
    /// Indexing directive string ("Include", "Exclude", "Default").
    pub indexing_directive: Option<String>,
    /// Only apply the operation if the item's etag matches.
    pub if_match_etag: Option<String>,
    /// Only apply the operation if the item's etag does not match.
    pub if_none_match_etag: Option<String>,
    /// Time-to-live override in seconds.
    pub time_to_live_seconds: Option<i32>,
    /// Ask the backend to omit the resource body from write responses.
    pub minimal_response: Option<bool>,
    /// Binary item id, sent alongside the string id.
    pub binary_id: Option<Bytes>,
    /// Effective partition key bytes.
    pub effective_partition_key: Option<Bytes>,
    /// String form of the effective partition key; must accompany the bytes.
    pub effective_partition_key_string: Option<String>,
    /// Raw partition key header value; must accompany an EPK string.
    pub partition_key_string: Option<String>,

    /// Not supported per operation in bulk.
    pub consistency_level: Option<ConsistencyLevel>,
    /// Not supported per operation in bulk.
    pub pre_triggers: Option<Vec<String>>,
    /// Not supported per operation in bulk.
    pub post_triggers: Option<Vec<String>>,
    /// Not supported per operation in bulk.
    pub session_token: Option<String>,
    /// Not supported per operation in bulk.
    pub max_integrated_cache_staleness: Option<Duration>,
}

impl ItemRequestOptions {
    /// Rejects options that a bulk batch cannot honour per operation.
    pub fn validate_for_bulk(&self) -> Result<()> {
        if self.consistency_level.is_some() {
            return Err(Error::UnsupportedOption(
                "consistency level must be set on the client, not per bulk operation".into(),
            ));
        }
        if self.pre_triggers.is_some() || self.post_triggers.is_some() {
            return Err(Error::UnsupportedOption(
                "triggers are not supported in bulk operations".into(),
            ));
        }
        if self.session_token.is_some() {
            return Err(Error::UnsupportedOption(
                "session token is not supported in bulk operations".into(),
            ));
        }
        if self.max_integrated_cache_staleness.is_some() {
            return Err(Error::UnsupportedOption(
                "integrated cache staleness is not supported in bulk operations".into(),
            ));
        }
        Ok(())
    }

    /// Checks the effective-partition-key property pairing rules.
    ///
    /// An EPK string must come with either the EPK bytes or a raw partition
    /// key string, and none of them may be combined with a logical
    /// partition key on the operation itself.
    pub fn validate_effective_partition_key(&self, has_partition_key: bool) -> Result<()> {
        let epk = self.effective_partition_key.is_some();
        let epk_string = self.effective_partition_key_string.is_some();
        let pk_string = self.partition_key_string.is_some();

        if !(epk || epk_string || pk_string) {
            return Ok(());
        }
        if (!epk && !pk_string) || !epk_string {
            return Err(Error::InvalidOperation(
                "effective partition key bytes (or partition key string) and its string form \
                 must be set together"
                    .into(),
            ));
        }
        if has_partition_key {
            return Err(Error::InvalidOperation(
                "partition key and effective partition key may not both be set".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Resource Payloads
// =============================================================================

/// The body an operation sends.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Resource {
    /// No body (reads and deletes).
    #[default]
    Empty,
    /// Already-materialized bytes.
    Raw(Bytes),
    /// A JSON value that is serialized on admission.
    Value(Value),
}

impl Resource {
    /// Returns the materialized bytes, if any.
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Resource::Raw(b) => Some(b),
            _ => None,
        }
    }

    /// Length of the materialized body (0 when empty or not yet materialized).
    pub fn materialized_len(&self) -> usize {
        self.bytes().map_or(0, |b| b.len())
    }

    /// True once the body no longer needs serialization.
    pub fn is_materialized(&self) -> bool {
        !matches!(self, Resource::Value(_))
    }
}

// =============================================================================
// Item Operations
// =============================================================================

/// One item-level action submitted to the bulk pipeline.
///
/// This is the "input" form. The pipeline fills in `partition_key_json`
/// during routing and re-assigns `operation_index` every time the operation
/// lands in a new physical batch.
#[derive(Debug)]
pub struct ItemOperation {
    /// What the operation does.
    pub kind: OperationKind,

    /// Position inside the batch currently holding the operation.
    pub operation_index: u32,

    /// Item id (required for read, replace, delete, patch).
    pub id: Option<String>,

    /// Logical partition key.
    pub partition_key: Option<PartitionKey>,

    /// Wire form of the partition key, set during routing.
    pub partition_key_json: Option<String>,

    /// Resource body.
    pub resource: Resource,

    /// Per-operation request options.
    pub options: Option<ItemRequestOptions>,

    /// Completion tracking, attached once on admission.
    context: Option<Arc<OperationContext>>,
}

impl ItemOperation {
    /// Creates an operation of any kind.
    pub fn new(
        kind: OperationKind,
        id: Option<String>,
        partition_key: Option<PartitionKey>,
        resource: Resource,
    ) -> Self {
        Self {
            kind,
            operation_index: 0,
            id,
            partition_key,
            partition_key_json: None,
            resource,
            options: None,
            context: None,
        }
    }

    /// Creates an item; the id travels inside the body.
    pub fn create(partition_key: PartitionKey, body: Value) -> Self {
        Self::new(
            OperationKind::Create,
            None,
            Some(partition_key),
            Resource::Value(body),
        )
    }

    /// Creates or replaces an item; the id travels inside the body.
    pub fn upsert(partition_key: PartitionKey, body: Value) -> Self {
        Self::new(
            OperationKind::Upsert,
            None,
            Some(partition_key),
            Resource::Value(body),
        )
    }

    /// Replaces the item with the given id.
    pub fn replace(id: impl Into<String>, partition_key: PartitionKey, body: Value) -> Self {
        Self::new(
            OperationKind::Replace,
            Some(id.into()),
            Some(partition_key),
            Resource::Value(body),
        )
    }

    /// Reads the item with the given id.
    pub fn read(id: impl Into<String>, partition_key: PartitionKey) -> Self {
        Self::new(
            OperationKind::Read,
            Some(id.into()),
            Some(partition_key),
            Resource::Empty,
        )
    }

    /// Deletes the item with the given id.
    pub fn delete(id: impl Into<String>, partition_key: PartitionKey) -> Self {
        Self::new(
            OperationKind::Delete,
            Some(id.into()),
            Some(partition_key),
            Resource::Empty,
        )
    }

    /// Applies a patch document to the item with the given id.
    pub fn patch(id: impl Into<String>, partition_key: PartitionKey, patch: Value) -> Self {
        Self::new(
            OperationKind::Patch,
            Some(id.into()),
            Some(partition_key),
            Resource::Value(patch),
        )
    }

    /// Sets the operation's index (builder pattern).
    pub fn with_index(mut self, index: u32) -> Self {
        self.operation_index = index;
        self
    }

    /// Attaches request options (builder pattern).
    pub fn with_options(mut self, options: ItemRequestOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Uses an already-materialized body (builder pattern).
    pub fn with_raw_body(mut self, body: impl Into<Bytes>) -> Self {
        self.resource = Resource::Raw(body.into());
        self
    }

    /// Attaches the completion context. An operation has exactly one.
    pub fn attach_context(&mut self, context: Arc<OperationContext>) -> Result<()> {
        if self.context.is_some() {
            return Err(Error::ContextAlreadyAttached);
        }
        self.context = Some(context);
        Ok(())
    }

    /// Returns the attached completion context.
    pub fn context(&self) -> Option<&Arc<OperationContext>> {
        self.context.as_ref()
    }

    /// Estimated encoded size, used for admission into a batcher.
    ///
    /// Counts the variable-length fields and adds a flat
    /// [`APPROXIMATE_RECORD_OVERHEAD`]. The codec measures the real size
    /// when packing.
    pub fn approximate_serialized_length(&self) -> usize {
        let mut length = APPROXIMATE_RECORD_OVERHEAD;
        length += self.id.as_ref().map_or(0, |s| s.len());
        length += self.partition_key_json.as_ref().map_or(0, |s| s.len());
        length += self.resource.materialized_len();
        if let Some(options) = &self.options {
            length += options.if_match_etag.as_ref().map_or(0, |s| s.len());
            length += options.if_none_match_etag.as_ref().map_or(0, |s| s.len());
            length += options.binary_id.as_ref().map_or(0, |b| b.len());
            length += options.effective_partition_key.as_ref().map_or(0, |b| b.len());
        }
        length
    }
}

// =============================================================================
// Operation Results
// =============================================================================

/// The outcome of one operation, as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    /// Status of this operation.
    pub status: StatusCode,
    /// Sub-status of this operation.
    pub sub_status: SubStatusCode,
    /// Etag of the item after the operation.
    pub etag: Option<String>,
    /// Resource body returned by the backend.
    pub resource_body: Option<Bytes>,
    /// Back-off requested by the backend.
    pub retry_after: Option<Duration>,
    /// Cost metric charged for the operation, rounded to two decimals.
    pub request_charge: f64,
}

impl OperationResult {
    /// Creates a bare result with only a status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            sub_status: SubStatusCode::UNKNOWN,
            etag: None,
            resource_body: None,
            retry_after: None,
            request_charge: 0.0,
        }
    }

    /// Sets the sub-status (builder pattern).
    pub fn with_sub_status(mut self, sub_status: SubStatusCode) -> Self {
        self.sub_status = sub_status;
        self
    }

    /// Sets the etag (builder pattern).
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Sets the resource body (builder pattern).
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.resource_body = Some(body.into());
        self
    }

    /// Sets the retry-after hint (builder pattern).
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Sets the request charge, rounding to two decimals (builder pattern).
    pub fn with_request_charge(mut self, charge: f64) -> Self {
        self.request_charge = round_charge(charge);
        self
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// True when the result asks for the operation to be re-routed.
    pub fn is_partition_moved(&self) -> bool {
        is_partition_moved(self.status, self.sub_status)
    }

    /// Deserializes the resource body, if there is one.
    pub fn resource<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.resource_body {
            Some(body) => Ok(Some(serde_json::from_slice(body)?)),
            None => Ok(None),
        }
    }
}

/// Rounds a request charge to two decimal places.
pub fn round_charge(charge: f64) -> f64 {
    (charge * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_key_json() {
        assert_eq!(PartitionKey::from("a").to_json(), r#"["a"]"#);
        assert_eq!(PartitionKey::from(7i64).to_json(), "[7]");
        assert_eq!(PartitionKey::Null.to_json(), "[null]");
        assert_eq!(PartitionKey::None.to_json(), "[{}]");
    }

    #[test]
    fn test_operation_kind_codes_round_trip() {
        for kind in [
            OperationKind::Create,
            OperationKind::Read,
            OperationKind::Upsert,
            OperationKind::Replace,
            OperationKind::Delete,
            OperationKind::Patch,
        ] {
            assert_eq!(OperationKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(OperationKind::from_code(99), None);
    }

    #[test]
    fn test_partition_moved_family() {
        assert!(is_partition_moved(
            StatusCode::GONE,
            SubStatusCode::PARTITION_KEY_RANGE_GONE
        ));
        assert!(is_partition_moved(
            StatusCode::GONE,
            SubStatusCode::COMPLETING_SPLIT
        ));
        assert!(!is_partition_moved(StatusCode::GONE, SubStatusCode::UNKNOWN));
        assert!(!is_partition_moved(
            StatusCode::TOO_MANY_REQUESTS,
            SubStatusCode::PARTITION_KEY_RANGE_GONE
        ));
    }

    #[test]
    fn test_approximate_length_counts_variable_fields() {
        let mut op = ItemOperation::read("abc", PartitionKey::from("pk"));
        let base = op.approximate_serialized_length();
        assert_eq!(base, APPROXIMATE_RECORD_OVERHEAD + 3);

        op.partition_key_json = Some(r#"["pk"]"#.to_string());
        op = op.with_raw_body(vec![0u8; 10]);
        op.options = Some(ItemRequestOptions {
            if_match_etag: Some("etag".into()),
            ..Default::default()
        });
        assert_eq!(op.approximate_serialized_length(), base + 6 + 10 + 4);
    }

    #[test]
    fn test_bulk_rejects_unsupported_options() {
        let ok = ItemRequestOptions {
            if_match_etag: Some("e".into()),
            time_to_live_seconds: Some(10),
            ..Default::default()
        };
        assert!(ok.validate_for_bulk().is_ok());

        let session = ItemRequestOptions {
            session_token: Some("0:1".into()),
            ..Default::default()
        };
        assert!(matches!(
            session.validate_for_bulk(),
            Err(Error::UnsupportedOption(_))
        ));

        let triggers = ItemRequestOptions {
            pre_triggers: Some(vec!["t".into()]),
            ..Default::default()
        };
        assert!(triggers.validate_for_bulk().is_err());
    }

    #[test]
    fn test_effective_partition_key_pairing() {
        let epk_only = ItemRequestOptions {
            effective_partition_key: Some(Bytes::from_static(b"A")),
            ..Default::default()
        };
        assert!(epk_only.validate_effective_partition_key(false).is_err());

        let string_only = ItemRequestOptions {
            effective_partition_key_string: Some("epk".into()),
            ..Default::default()
        };
        assert!(string_only.validate_effective_partition_key(false).is_err());

        let paired = ItemRequestOptions {
            effective_partition_key: Some(Bytes::from_static(b"A")),
            effective_partition_key_string: Some("epk".into()),
            ..Default::default()
        };
        assert!(paired.validate_effective_partition_key(false).is_ok());
        assert!(paired.validate_effective_partition_key(true).is_err());
    }

    #[test]
    fn test_request_charge_rounding() {
        let result = OperationResult::new(StatusCode::OK).with_request_charge(3.14159);
        assert_eq!(result.request_charge, 3.14);
    }

    #[test]
    fn test_builders_set_fields() {
        let op = ItemOperation::patch("id-1", PartitionKey::from("p"), json!([{"op": "add"}]))
            .with_index(4);
        assert_eq!(op.kind, OperationKind::Patch);
        assert_eq!(op.operation_index, 4);
        assert_eq!(op.id.as_deref(), Some("id-1"));
        assert!(!op.resource.is_materialized());
    }
}
