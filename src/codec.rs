//! # Batch Body Encoding and Decoding
//!
//! This module turns a list of [`ItemOperation`]s into a record-stream request
//! body and turns a record-stream response body back into per-operation
//! [`OperationResult`]s. The layout itself lives in [`crate::schema`].
//!
//! ## Packing
//!
//! [`pack_operations`] is greedy and order preserving:
//!
//! ```text
//! ops:      [op0][op1][op2][op3][op4]
//!                          ▲
//!                          └─ op2 would push the body past max_bytes
//! packed:   [op0][op1]                  packed_count = 2
//! overflow:           [op2][op3][op4]   = &ops[2..]
//! ```
//!
//! Record sizes are measured exactly while encoding. The estimate the batcher
//! uses for admission ([`ItemOperation::approximate_serialized_length`]) is
//! only a heuristic, which is why packing can overflow.
//!
//! A lone first record larger than `max_bytes` is still packed, so a request
//! is never empty when at least one operation was offered.
//!
//! ## Response Assembly
//!
//! [`BatchResponse::from_wire`] never fails. A body that does not parse, or
//! that carries the wrong number of results, degrades to one synthesized
//! result per operation so every caller still gets exactly one outcome.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{Error, Result};
use crate::schema::{
    request, response, FieldKind, RecordLayout, BODY_HEADER_LEN, FIELD_HEADER_LEN, FORMAT_MARKER,
    RECORD_HEADER_LEN, REQUEST_LAYOUT, RESOURCE_TYPE_DOCUMENT, RESPONSE_LAYOUT,
};
use crate::transport::WireResponse;
use crate::types::{
    round_charge, ItemOperation, ItemRequestOptions, OperationKind, OperationResult, Resource,
    StatusCode, SubStatusCode,
};

// =============================================================================
// Packing
// =============================================================================

/// The encoded prefix of an operation list.
#[derive(Debug, Clone)]
pub struct PackedBatch {
    /// Record-stream request body.
    pub body: Bytes,
    /// How many leading operations are in `body`.
    pub packed_count: usize,
}

impl PackedBatch {
    /// True when nothing was packed.
    pub fn is_empty(&self) -> bool {
        self.packed_count == 0
    }
}

/// Packs the longest prefix of `ops` that fits the budgets.
///
/// # Arguments
///
/// * `ops` - Operations in submission order
/// * `max_bytes` - Body size budget (header included)
/// * `max_count` - Maximum number of records
/// * `ensure_continuous_index` - Stop at the first operation whose index is
///   not the previous index + 1
///
/// # Errors
///
/// Only when a resource body cannot be serialized.
pub fn pack_operations(
    ops: &[ItemOperation],
    max_bytes: usize,
    max_count: usize,
    ensure_continuous_index: bool,
) -> Result<PackedBatch> {
    let mut body = BytesMut::new();
    body.put_u8(FORMAT_MARKER);
    body.put_u8(REQUEST_LAYOUT.id);

    let mut packed_count = 0usize;
    let mut previous_index: Option<u32> = None;

    for op in ops {
        if packed_count >= max_count {
            break;
        }

        if ensure_continuous_index {
            if let Some(previous) = previous_index {
                if previous.checked_add(1) != Some(op.operation_index) {
                    break;
                }
            }
        }

        let fields = encode_operation_fields(op)?;
        let record_len = RECORD_HEADER_LEN + fields.len();

        // The first record always goes in, even when it alone is too big.
        if packed_count > 0 && body.len() + record_len > max_bytes {
            break;
        }

        put_record(&mut body, &fields);
        packed_count += 1;
        previous_index = Some(op.operation_index);
    }

    Ok(PackedBatch {
        body: body.freeze(),
        packed_count,
    })
}

/// Exact encoded size of one operation's record.
pub fn encoded_record_len(op: &ItemOperation) -> Result<usize> {
    Ok(RECORD_HEADER_LEN + encode_operation_fields(op)?.len())
}

fn encode_operation_fields(op: &ItemOperation) -> Result<BytesMut> {
    let mut fields = BytesMut::new();

    put_field(&mut fields, request::OPERATION_TYPE, &op.kind.code().to_le_bytes());
    put_field(&mut fields, request::RESOURCE_TYPE, &RESOURCE_TYPE_DOCUMENT.to_le_bytes());

    if let Some(pk) = &op.partition_key_json {
        put_field(&mut fields, request::PARTITION_KEY, pk.as_bytes());
    }
    if let Some(id) = &op.id {
        put_field(&mut fields, request::ID, id.as_bytes());
    }

    match &op.resource {
        Resource::Empty => {}
        Resource::Raw(bytes) => put_field(&mut fields, request::RESOURCE_BODY, bytes),
        Resource::Value(value) => {
            let bytes = serde_json::to_vec(value)?;
            put_field(&mut fields, request::RESOURCE_BODY, &bytes);
        }
    }

    if let Some(options) = &op.options {
        if let Some(directive) = &options.indexing_directive {
            put_field(&mut fields, request::INDEXING_DIRECTIVE, directive.as_bytes());
        }
        if let Some(etag) = &options.if_match_etag {
            put_field(&mut fields, request::IF_MATCH, etag.as_bytes());
        }
        if let Some(etag) = &options.if_none_match_etag {
            put_field(&mut fields, request::IF_NONE_MATCH, etag.as_bytes());
        }
        if let Some(binary_id) = &options.binary_id {
            put_field(&mut fields, request::BINARY_ID, binary_id);
        }
        if let Some(epk) = &options.effective_partition_key {
            put_field(&mut fields, request::EFFECTIVE_PARTITION_KEY, epk);
        }
        if let Some(ttl) = options.time_to_live_seconds {
            put_field(&mut fields, request::TIME_TO_LIVE, &ttl.to_le_bytes());
        }
        if let Some(minimal) = options.minimal_response {
            put_field(&mut fields, request::MINIMAL_RETURN_PREFERENCE, &[minimal as u8]);
        }
    }

    Ok(fields)
}

// =============================================================================
// Result Encoding (server side)
// =============================================================================

/// Encodes results as a response body.
///
/// This is what a backend produces; the client only decodes. It is used by
/// [`crate::memory::MemoryBackend`] and by tests.
pub fn encode_results(results: &[OperationResult]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(FORMAT_MARKER);
    body.put_u8(RESPONSE_LAYOUT.id);

    for result in results {
        let mut fields = BytesMut::new();
        put_field(
            &mut fields,
            response::STATUS_CODE,
            &i32::from(result.status.as_raw()).to_le_bytes(),
        );
        if result.sub_status != SubStatusCode::UNKNOWN {
            put_field(
                &mut fields,
                response::SUB_STATUS_CODE,
                &(result.sub_status.as_raw() as i32).to_le_bytes(),
            );
        }
        if let Some(etag) = &result.etag {
            put_field(&mut fields, response::ETAG, etag.as_bytes());
        }
        if let Some(body) = &result.resource_body {
            put_field(&mut fields, response::RESOURCE_BODY, body);
        }
        if let Some(retry_after) = result.retry_after {
            let ms = u32::try_from(retry_after.as_millis()).unwrap_or(u32::MAX);
            put_field(&mut fields, response::RETRY_AFTER_MS, &ms.to_le_bytes());
        }
        if result.request_charge != 0.0 {
            put_field(
                &mut fields,
                response::REQUEST_CHARGE,
                &result.request_charge.to_le_bytes(),
            );
        }
        put_record(&mut body, &fields);
    }

    body.freeze()
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a response body into ordered results.
///
/// # Errors
///
/// [`Error::Framing`] for a wrong marker or layout id, a truncated record, a
/// checksum mismatch, a malformed field, or a record without a status code.
pub fn unpack_results(body: &[u8]) -> Result<Vec<OperationResult>> {
    let mut results = Vec::new();
    for record in RecordReader::new(body, &RESPONSE_LAYOUT)? {
        let record = record?;
        let status = record
            .i32(response::STATUS_CODE)
            .ok_or_else(|| Error::Framing("result record without status code".into()))?;
        let status = u16::try_from(status)
            .map_err(|_| Error::Framing(format!("status code {} out of range", status)))?;

        let mut result = OperationResult::new(StatusCode::from_raw(status));
        if let Some(sub) = record.i32(response::SUB_STATUS_CODE) {
            result.sub_status = SubStatusCode::from_raw(sub as u32);
        }
        result.etag = record.string(response::ETAG)?;
        result.resource_body = record.bytes(response::RESOURCE_BODY);
        result.retry_after = record
            .u32(response::RETRY_AFTER_MS)
            .map(|ms| Duration::from_millis(u64::from(ms)));
        if let Some(charge) = record.f64(response::REQUEST_CHARGE) {
            result.request_charge = round_charge(charge);
        }
        results.push(result);
    }
    Ok(results)
}

/// Decodes a request body back into operations (server side).
///
/// Operations come back with `operation_index` equal to their position, the
/// wire partition key in `partition_key_json` and raw resource bodies.
pub fn unpack_operations(body: &[u8]) -> Result<Vec<ItemOperation>> {
    let mut ops = Vec::new();
    for (index, record) in RecordReader::new(body, &REQUEST_LAYOUT)?.enumerate() {
        let record = record?;
        let code = record
            .i32(request::OPERATION_TYPE)
            .ok_or_else(|| Error::Framing("operation record without operation type".into()))?;
        let kind = OperationKind::from_code(code)
            .ok_or_else(|| Error::Framing(format!("unknown operation type {}", code)))?;

        let resource = match record.bytes(request::RESOURCE_BODY) {
            Some(bytes) => Resource::Raw(bytes),
            None => Resource::Empty,
        };

        let mut op = ItemOperation::new(kind, record.string(request::ID)?, None, resource)
            .with_index(index as u32);
        op.partition_key_json = record.string(request::PARTITION_KEY)?;

        let options = ItemRequestOptions {
            indexing_directive: record.string(request::INDEXING_DIRECTIVE)?,
            if_match_etag: record.string(request::IF_MATCH)?,
            if_none_match_etag: record.string(request::IF_NONE_MATCH)?,
            time_to_live_seconds: record.i32(request::TIME_TO_LIVE),
            minimal_response: record.bool(request::MINIMAL_RETURN_PREFERENCE),
            binary_id: record.bytes(request::BINARY_ID),
            effective_partition_key: record.bytes(request::EFFECTIVE_PARTITION_KEY),
            ..Default::default()
        };
        if options != ItemRequestOptions::default() {
            op.options = Some(options);
        }
        ops.push(op);
    }
    Ok(ops)
}

// =============================================================================
// Response Assembly
// =============================================================================

/// A wire response demultiplexed into per-operation results.
#[derive(Debug, Clone)]
pub struct BatchResponse {
    /// Batch-level status (after multi-status promotion).
    pub status: StatusCode,
    pub sub_status: SubStatusCode,
    pub retry_after: Option<Duration>,
    pub request_charge: f64,
    pub activity_id: String,
    /// One result per operation in the request, in request order.
    pub results: Vec<OperationResult>,
}

impl BatchResponse {
    /// Builds per-operation results for a request of `operation_count` records.
    ///
    /// 1. The body parses and holds `operation_count` results: use them.
    /// 2. Otherwise, on a wire error status, every operation gets the wire
    ///    status, sub-status and retry-after.
    /// 3. Otherwise every operation gets 500.
    ///
    /// On a 207 the first result that is not 424 supplies the batch status.
    pub fn from_wire(wire: WireResponse, operation_count: usize) -> Self {
        let mut status = wire.status;
        let mut sub_status = wire.sub_status;

        let results = match unpack_results(&wire.body) {
            Ok(results) if results.len() == operation_count => results,
            parsed => {
                if wire.status.is_error() {
                    (0..operation_count)
                        .map(|_| {
                            let mut result =
                                OperationResult::new(wire.status).with_sub_status(wire.sub_status);
                            result.retry_after = wire.retry_after;
                            result
                        })
                        .collect()
                } else {
                    match parsed {
                        Ok(results) => warn!(
                            expected = operation_count,
                            received = results.len(),
                            activity_id = %wire.activity_id,
                            "result count mismatch in batch response"
                        ),
                        Err(e) => warn!(
                            error = %e,
                            activity_id = %wire.activity_id,
                            "unparseable batch response body"
                        ),
                    }
                    status = StatusCode::INTERNAL_SERVER_ERROR;
                    sub_status = SubStatusCode::UNKNOWN;
                    (0..operation_count)
                        .map(|_| OperationResult::new(StatusCode::INTERNAL_SERVER_ERROR))
                        .collect()
                }
            }
        };

        if status == StatusCode::MULTI_STATUS {
            if let Some(first) = results
                .iter()
                .find(|r| r.status != StatusCode::FAILED_DEPENDENCY)
            {
                status = first.status;
                sub_status = first.sub_status;
            }
        }

        Self {
            status,
            sub_status,
            retry_after: wire.retry_after,
            request_charge: round_charge(wire.request_charge),
            activity_id: wire.activity_id,
            results,
        }
    }

    /// True when the batch-level status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Computes the per-record checksum.
///
/// XXH3-64 over the record's field bytes.
pub fn compute_checksum(data: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(data)
}

fn put_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.reserve(FIELD_HEADER_LEN + value.len());
    buf.put_u8(tag);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn put_record(buf: &mut BytesMut, fields: &[u8]) {
    buf.reserve(RECORD_HEADER_LEN + fields.len());
    buf.put_u32_le(fields.len() as u32);
    buf.put_u64_le(compute_checksum(fields));
    buf.put_slice(fields);
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Iterates over the checksummed records of a body.
struct RecordReader<'a> {
    remaining: &'a [u8],
    layout: &'static RecordLayout,
}

impl<'a> RecordReader<'a> {
    fn new(body: &'a [u8], layout: &'static RecordLayout) -> Result<Self> {
        if body.len() < BODY_HEADER_LEN {
            return Err(Error::Framing("body shorter than header".into()));
        }
        if body[0] != FORMAT_MARKER {
            return Err(Error::Framing(format!(
                "unexpected format marker 0x{:02x}",
                body[0]
            )));
        }
        if body[1] != layout.id {
            return Err(Error::Framing(format!(
                "expected {} layout {}, found {}",
                layout.name, layout.id, body[1]
            )));
        }
        Ok(Self {
            remaining: &body[BODY_HEADER_LEN..],
            layout,
        })
    }

    fn parse_record(&mut self) -> Result<Record<'a>> {
        if self.remaining.len() < RECORD_HEADER_LEN {
            return Err(Error::Framing("truncated record header".into()));
        }
        let fields_len = read_u32_le(self.remaining) as usize;
        let checksum = read_u64_le(&self.remaining[4..]);
        let rest = &self.remaining[RECORD_HEADER_LEN..];
        if rest.len() < fields_len {
            return Err(Error::Framing("truncated record".into()));
        }
        let (fields, tail) = rest.split_at(fields_len);
        if compute_checksum(fields) != checksum {
            return Err(Error::Framing("record checksum mismatch".into()));
        }
        self.remaining = tail;
        Record::parse(fields, self.layout)
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let record = self.parse_record();
        if record.is_err() {
            // Stop after the first framing error.
            self.remaining = &[];
        }
        Some(record)
    }
}

/// The known fields of one record.
struct Record<'a> {
    fields: Vec<(u8, &'a [u8])>,
}

impl<'a> Record<'a> {
    fn parse(mut data: &'a [u8], layout: &RecordLayout) -> Result<Self> {
        let mut fields = Vec::new();
        while !data.is_empty() {
            if data.len() < FIELD_HEADER_LEN {
                return Err(Error::Framing("truncated field header".into()));
            }
            let tag = data[0];
            let len = read_u32_le(&data[1..]) as usize;
            let rest = &data[FIELD_HEADER_LEN..];
            if rest.len() < len {
                return Err(Error::Framing(format!("truncated field {}", tag)));
            }
            let (value, tail) = rest.split_at(len);
            data = tail;

            let Some(def) = layout.field(tag) else {
                continue;
            };
            if let Some(expected) = def.kind.fixed_len() {
                if value.len() != expected {
                    return Err(Error::Framing(format!(
                        "field {} has {} bytes, expected {}",
                        def.name,
                        value.len(),
                        expected
                    )));
                }
            }
            if def.kind == FieldKind::Bool && value[0] > 1 {
                return Err(Error::Framing(format!("field {} is not a bool", def.name)));
            }
            fields.push((tag, value));
        }
        Ok(Self { fields })
    }

    fn get(&self, tag: u8) -> Option<&'a [u8]> {
        self.fields.iter().find(|(t, _)| *t == tag).map(|(_, v)| *v)
    }

    // Fixed-width lengths were checked in `parse`.
    fn i32(&self, tag: u8) -> Option<i32> {
        self.get(tag).map(|v| read_u32_le(v) as i32)
    }

    fn u32(&self, tag: u8) -> Option<u32> {
        self.get(tag).map(read_u32_le)
    }

    fn f64(&self, tag: u8) -> Option<f64> {
        self.get(tag).map(|v| f64::from_bits(read_u64_le(v)))
    }

    fn bool(&self, tag: u8) -> Option<bool> {
        self.get(tag).map(|v| v[0] == 1)
    }

    fn string(&self, tag: u8) -> Result<Option<String>> {
        self.get(tag)
            .map(|v| {
                std::str::from_utf8(v)
                    .map(str::to_owned)
                    .map_err(|_| Error::Framing(format!("field {} is not utf-8", tag)))
            })
            .transpose()
    }

    fn bytes(&self, tag: u8) -> Option<Bytes> {
        self.get(tag).map(Bytes::copy_from_slice)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionKey;
    use serde_json::json;

    fn read_op(id: &str, index: u32) -> ItemOperation {
        let mut op = ItemOperation::read(id, PartitionKey::from("pk")).with_index(index);
        op.partition_key_json = Some(PartitionKey::from("pk").to_json());
        op
    }

    #[test]
    fn test_pack_respects_count_budget() {
        let ops: Vec<_> = (0..5).map(|i| read_op(&format!("id-{}", i), i)).collect();
        let packed = pack_operations(&ops, usize::MAX, 3, false).unwrap();
        assert_eq!(packed.packed_count, 3);
    }

    #[test]
    fn test_pack_respects_byte_budget() {
        let ops: Vec<_> = (0..4).map(|i| read_op(&format!("id-{}", i), i)).collect();
        let one = encoded_record_len(&ops[0]).unwrap();
        let budget = BODY_HEADER_LEN + 2 * one;

        let packed = pack_operations(&ops, budget, 100, false).unwrap();
        assert_eq!(packed.packed_count, 2);
        assert_eq!(packed.body.len(), budget);
    }

    #[test]
    fn test_pack_oversized_singleton_still_packed() {
        let big = ItemOperation::create(PartitionKey::from("pk"), json!({"id": "x"}))
            .with_raw_body(vec![7u8; 1000]);
        let ops = vec![big, read_op("after", 1)];

        let packed = pack_operations(&ops, 100, 10, false).unwrap();
        assert_eq!(packed.packed_count, 1);
        assert!(packed.body.len() > 100);
    }

    #[test]
    fn test_pack_stops_at_index_gap() {
        let ops = vec![read_op("a", 0), read_op("b", 1), read_op("c", 3), read_op("d", 4)];
        let packed = pack_operations(&ops, usize::MAX, 100, true).unwrap();
        assert_eq!(packed.packed_count, 2);

        let unchecked = pack_operations(&ops, usize::MAX, 100, false).unwrap();
        assert_eq!(unchecked.packed_count, 4);
    }

    #[test]
    fn test_pack_empty_input() {
        let packed = pack_operations(&[], 100, 10, false).unwrap();
        assert!(packed.is_empty());
        assert_eq!(packed.body.len(), BODY_HEADER_LEN);
    }

    #[test]
    fn test_operations_decode_with_options() {
        let mut op = ItemOperation::replace("item", PartitionKey::from("p"), json!({"id": "item"}))
            .with_options(ItemRequestOptions {
                if_match_etag: Some("\"e1\"".into()),
                time_to_live_seconds: Some(60),
                minimal_response: Some(true),
                ..Default::default()
            });
        op.partition_key_json = Some(r#"["p"]"#.into());

        let packed = pack_operations(std::slice::from_ref(&op), usize::MAX, 10, false).unwrap();
        let decoded = unpack_operations(&packed.body).unwrap();

        assert_eq!(decoded.len(), 1);
        let back = &decoded[0];
        assert_eq!(back.kind, OperationKind::Replace);
        assert_eq!(back.id.as_deref(), Some("item"));
        assert_eq!(back.partition_key_json.as_deref(), Some(r#"["p"]"#));
        let options = back.options.as_ref().unwrap();
        assert_eq!(options.if_match_etag.as_deref(), Some("\"e1\""));
        assert_eq!(options.time_to_live_seconds, Some(60));
        assert_eq!(options.minimal_response, Some(true));
        let body: serde_json::Value =
            serde_json::from_slice(back.resource.bytes().unwrap()).unwrap();
        assert_eq!(body["id"], "item");
    }

    #[test]
    fn test_results_decode() {
        let results = vec![
            OperationResult::new(StatusCode::CREATED)
                .with_etag("e1")
                .with_request_charge(5.238),
            OperationResult::new(StatusCode::TOO_MANY_REQUESTS)
                .with_sub_status(SubStatusCode::from_raw(3200))
                .with_retry_after(Duration::from_millis(250)),
        ];
        let decoded = unpack_results(&encode_results(&results)).unwrap();
        assert_eq!(decoded, results);
        assert_eq!(decoded[0].request_charge, 5.24);
    }

    #[test]
    fn test_unpack_rejects_bad_marker() {
        let mut body = encode_results(&[OperationResult::new(StatusCode::OK)]).to_vec();
        body[0] = 0x00;
        assert!(matches!(unpack_results(&body), Err(Error::Framing(_))));
    }

    #[test]
    fn test_unpack_rejects_wrong_layout() {
        let ops = vec![read_op("a", 0)];
        let packed = pack_operations(&ops, usize::MAX, 10, false).unwrap();
        assert!(matches!(unpack_results(&packed.body), Err(Error::Framing(_))));
    }

    #[test]
    fn test_unpack_rejects_corruption() {
        let mut body = encode_results(&[OperationResult::new(StatusCode::OK).with_etag("abc")])
            .to_vec();
        let last = body.len() - 1;
        body[last] ^= 0xff;
        let err = unpack_results(&body).unwrap_err();
        assert_eq!(err, Error::Framing("record checksum mismatch".into()));
    }

    #[test]
    fn test_unpack_rejects_truncation() {
        let body = encode_results(&[OperationResult::new(StatusCode::OK)]);
        let truncated = &body[..body.len() - 2];
        assert!(matches!(unpack_results(truncated), Err(Error::Framing(_))));
    }

    #[test]
    fn test_unpack_requires_status() {
        let mut fields = BytesMut::new();
        put_field(&mut fields, response::ETAG, b"e");
        let mut body = BytesMut::new();
        body.put_u8(FORMAT_MARKER);
        body.put_u8(RESPONSE_LAYOUT.id);
        put_record(&mut body, &fields);
        assert!(matches!(unpack_results(&body), Err(Error::Framing(_))));
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut fields = BytesMut::new();
        put_field(&mut fields, response::STATUS_CODE, &200i32.to_le_bytes());
        put_field(&mut fields, 99, b"future field");
        let mut body = BytesMut::new();
        body.put_u8(FORMAT_MARKER);
        body.put_u8(RESPONSE_LAYOUT.id);
        put_record(&mut body, &fields);

        let results = unpack_results(&body).unwrap();
        assert_eq!(results[0].status, StatusCode::OK);
    }

    #[test]
    fn test_from_wire_count_mismatch_degrades_to_500() {
        let body = encode_results(&[OperationResult::new(StatusCode::OK)]);
        let response = BatchResponse::from_wire(WireResponse::new(StatusCode::OK, body), 3);
        assert_eq!(response.results.len(), 3);
        assert!(response
            .results
            .iter()
            .all(|r| r.status == StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_from_wire_error_status_distributed() {
        let wire = WireResponse::new(StatusCode::TOO_MANY_REQUESTS, Bytes::from_static(b"busy"))
            .with_sub_status(SubStatusCode::from_raw(3200))
            .with_retry_after(Duration::from_millis(40));
        let response = BatchResponse::from_wire(wire, 2);
        assert_eq!(response.results.len(), 2);
        for result in &response.results {
            assert_eq!(result.status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(result.sub_status.as_raw(), 3200);
            assert_eq!(result.retry_after, Some(Duration::from_millis(40)));
        }
    }

    #[test]
    fn test_from_wire_multi_status_promotion() {
        let body = encode_results(&[
            OperationResult::new(StatusCode::FAILED_DEPENDENCY),
            OperationResult::new(StatusCode::CONFLICT),
            OperationResult::new(StatusCode::FAILED_DEPENDENCY),
        ]);
        let wire = WireResponse::new(StatusCode::MULTI_STATUS, body);
        let response = BatchResponse::from_wire(wire, 3);
        assert_eq!(response.status, StatusCode::CONFLICT);
        assert_eq!(response.results[1].status, StatusCode::CONFLICT);
    }
}
