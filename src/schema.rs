//! # Record-Stream Layout for bulkdb
//!
//! This module defines the binary layout shared by batch requests and batch
//! responses. The layout is described by constant tables rather than code so
//! that the encoder, the decoder and the in-memory backend all agree on one
//! definition.
//!
//! ## Body Overview
//!
//! ```text
//! ┌────────┬───────────┬──────────────────────┬──────────────────────┬─────┐
//! │ marker │ layout id │ record 0             │ record 1             │ ... │
//! │ 0x81   │ 1 byte    │ [len][xxh3][fields]  │ [len][xxh3][fields]  │     │
//! └────────┴───────────┴──────────────────────┴──────────────────────┴─────┘
//!
//! record:  [u32 LE fields_len][u64 LE xxh3(fields)][field]*
//! field:   [u8 tag][u32 LE value_len][value bytes]
//! ```
//!
//! Fields are sparse: only fields that carry a value are written. Readers skip
//! tags they do not recognise, which lets the layout grow without breaking
//! older decoders.
//!
//! ## Design Decisions
//!
//! ### Why a per-record checksum?
//!
//! A batch response is demultiplexed back to many independent callers. A
//! corrupted record must fail the whole body rather than hand one caller
//! another caller's status, so every record carries its own XXH3-64.

// =============================================================================
// Body Header
// =============================================================================

/// First byte of every record-stream body.
///
/// Bumped when the framing itself (not the field set) changes.
pub const FORMAT_MARKER: u8 = 0x81;

/// Bytes taken by the marker and the layout id.
pub const BODY_HEADER_LEN: usize = 2;

/// Bytes taken by a record's length prefix and checksum.
pub const RECORD_HEADER_LEN: usize = 4 + 8;

/// Bytes taken by a field's tag and length prefix.
pub const FIELD_HEADER_LEN: usize = 1 + 4;

/// Absolute upper bound for one encoded operation.
///
/// Operations above this size are rejected at admission; they could never be
/// sent even as a singleton request.
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Resource type code written for every item operation.
pub const RESOURCE_TYPE_DOCUMENT: i32 = 2;

// =============================================================================
// Field Definitions
// =============================================================================

/// How a field's value bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// 4-byte little-endian signed integer.
    I32,
    /// 4-byte little-endian unsigned integer.
    U32,
    /// 8-byte little-endian IEEE-754 double.
    F64,
    /// 1 byte, 0 or 1.
    Bool,
    /// UTF-8 text.
    String,
    /// Opaque bytes.
    Bytes,
}

impl FieldKind {
    /// Required value length for fixed-width kinds.
    pub const fn fixed_len(&self) -> Option<usize> {
        match self {
            FieldKind::I32 | FieldKind::U32 => Some(4),
            FieldKind::F64 => Some(8),
            FieldKind::Bool => Some(1),
            FieldKind::String | FieldKind::Bytes => None,
        }
    }
}

/// One field in a record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub tag: u8,
    pub name: &'static str,
    pub kind: FieldKind,
}

/// A named set of fields identified by a layout id byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub id: u8,
    pub name: &'static str,
    pub fields: &'static [FieldDef],
}

impl RecordLayout {
    /// Looks up a field by tag. Unknown tags return `None` and are skipped.
    pub fn field(&self, tag: u8) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.tag == tag)
    }
}

// =============================================================================
// Request Layout
// =============================================================================

pub mod request {
    //! Tags of the operation records in a batch request.

    use super::{FieldDef, FieldKind};

    pub const OPERATION_TYPE: u8 = 1;
    pub const RESOURCE_TYPE: u8 = 2;
    pub const PARTITION_KEY: u8 = 3;
    pub const ID: u8 = 4;
    pub const RESOURCE_BODY: u8 = 5;
    pub const INDEXING_DIRECTIVE: u8 = 6;
    pub const IF_MATCH: u8 = 7;
    pub const IF_NONE_MATCH: u8 = 8;
    pub const BINARY_ID: u8 = 9;
    pub const EFFECTIVE_PARTITION_KEY: u8 = 10;
    pub const TIME_TO_LIVE: u8 = 11;
    pub const MINIMAL_RETURN_PREFERENCE: u8 = 12;

    #[rustfmt::skip]
    pub(super) const FIELDS: &[FieldDef] = &[
        FieldDef { tag: OPERATION_TYPE, name: "operationType", kind: FieldKind::I32 },
        FieldDef { tag: RESOURCE_TYPE, name: "resourceType", kind: FieldKind::I32 },
        FieldDef { tag: PARTITION_KEY, name: "partitionKey", kind: FieldKind::String },
        FieldDef { tag: ID, name: "id", kind: FieldKind::String },
        FieldDef { tag: RESOURCE_BODY, name: "resourceBody", kind: FieldKind::Bytes },
        FieldDef { tag: INDEXING_DIRECTIVE, name: "indexingDirective", kind: FieldKind::String },
        FieldDef { tag: IF_MATCH, name: "ifMatch", kind: FieldKind::String },
        FieldDef { tag: IF_NONE_MATCH, name: "ifNoneMatch", kind: FieldKind::String },
        FieldDef { tag: BINARY_ID, name: "binaryId", kind: FieldKind::Bytes },
        FieldDef { tag: EFFECTIVE_PARTITION_KEY, name: "effectivePartitionKey", kind: FieldKind::Bytes },
        FieldDef { tag: TIME_TO_LIVE, name: "timeToLiveInSeconds", kind: FieldKind::I32 },
        FieldDef { tag: MINIMAL_RETURN_PREFERENCE, name: "minimalReturnPreference", kind: FieldKind::Bool },
    ];
}

/// Layout of operation records in a batch request.
pub const REQUEST_LAYOUT: RecordLayout = RecordLayout {
    id: 1,
    name: "Operation",
    fields: request::FIELDS,
};

// =============================================================================
// Response Layout
// =============================================================================

pub mod response {
    //! Tags of the result records in a batch response.

    use super::{FieldDef, FieldKind};

    pub const STATUS_CODE: u8 = 1;
    pub const SUB_STATUS_CODE: u8 = 2;
    pub const ETAG: u8 = 3;
    pub const RESOURCE_BODY: u8 = 4;
    pub const RETRY_AFTER_MS: u8 = 5;
    pub const REQUEST_CHARGE: u8 = 6;

    #[rustfmt::skip]
    pub(super) const FIELDS: &[FieldDef] = &[
        FieldDef { tag: STATUS_CODE, name: "statusCode", kind: FieldKind::I32 },
        FieldDef { tag: SUB_STATUS_CODE, name: "subStatusCode", kind: FieldKind::I32 },
        FieldDef { tag: ETAG, name: "eTag", kind: FieldKind::String },
        FieldDef { tag: RESOURCE_BODY, name: "resourceBody", kind: FieldKind::Bytes },
        FieldDef { tag: RETRY_AFTER_MS, name: "retryAfterMilliseconds", kind: FieldKind::U32 },
        FieldDef { tag: REQUEST_CHARGE, name: "requestCharge", kind: FieldKind::F64 },
    ];
}

/// Layout of result records in a batch response.
pub const RESPONSE_LAYOUT: RecordLayout = RecordLayout {
    id: 2,
    name: "Result",
    fields: response::FIELDS,
};

// =============================================================================
// Tests
// =============================================================================
