//! # Error Handling for bulkdb
//!
//! This module defines the error type used throughout the bulk pipeline. We use
//! a single error enum ([`Error`]) for every failure mode so that callers can
//! match on one type no matter which stage of the pipeline failed.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! The `#[error(...)]` attributes provide the `Display` text shown in logs.
//!
//! ## Why `Clone`?
//!
//! A single physical wire request carries many operations. When the whole
//! request fails (the transport errors, or the dispatcher is cancelled), the
//! same failure has to be delivered to every operation's completion slot.
//! Making the error `Clone` lets the batcher fan one failure out to N callers
//! without wrapping it in an `Arc`. This is also why foreign errors (such as
//! `serde_json::Error`) are stored as strings rather than with `#[from]`.
//!
//! ## Error Categories
//!
//! | Category | Variants | Surfaced |
//! |----------|----------|----------|
//! | Admission | `UnsupportedOption`, `InvalidOperation`, `OperationTooLarge`, ... | from `add` |
//! | Framing | `Framing` | degraded to a 500 result per operation |
//! | Transport | `Transport`, `Routing` | per operation |
//! | Protocol defect | `WrongBatcher`, `ContextAlreadyResolved` | per operation, logged |
//! | Lifecycle | `Cancelled`, `DispatcherClosed`, `OperationAbandoned` | per operation |
//! | Explicit batch | `InvalidBatch`, `BatchTooLarge` | from `execute` |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in bulkdb operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Admission Errors (returned before the operation is queued)
    // =========================================================================
    /// A per-operation request option is not allowed inside a bulk batch.
    ///
    /// Consistency level, triggers, session tokens and integrated-cache
    /// staleness can only be configured for the whole client, never for a
    /// single bulk operation.
    #[error("unsupported request option: {0}")]
    UnsupportedOption(String),

    /// The operation is malformed (missing id, missing partition key,
    /// conflicting effective-partition-key properties, ...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The operation's encoded form exceeds the absolute record limit.
    #[error("operation of {size} bytes exceeds the record limit of {limit} bytes")]
    OperationTooLarge {
        /// Encoded size of the offending operation
        size: usize,
        /// The absolute record limit
        limit: usize,
    },

    /// A completion context was attached to an operation that already had one.
    #[error("operation already has a completion context attached")]
    ContextAlreadyAttached,

    // =========================================================================
    // Wire Errors
    // =========================================================================
    /// A record-stream payload could not be parsed.
    #[error("framing error: {0}")]
    Framing(String),

    /// The transport collaborator failed to exchange a request.
    #[error("transport error: {0}")]
    Transport(String),

    /// Partition routing could not resolve a range for an operation.
    #[error("routing error: {0}")]
    Routing(String),

    /// A value could not be serialized into a resource body.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Protocol Defects (bugs in the dispatch/rotation invariants)
    // =========================================================================
    /// An operation was completed by a batcher that does not own it.
    ///
    /// # When This Happens
    ///
    /// Only when the rotation protocol is broken: a batcher dispatched after
    /// its operation was reassigned elsewhere. The real result is discarded
    /// and this error is delivered instead so the defect is visible.
    #[error("operation completed by wrong batcher: owner {owner:?}, completer {completer}")]
    WrongBatcher {
        /// The batcher that currently owns the context, if any
        owner: Option<u64>,
        /// The batcher that attempted the completion
        completer: u64,
    },

    /// A completion slot was resolved twice.
    #[error("operation context already resolved")]
    ContextAlreadyResolved,

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The dispatcher (or the client owning it) has been shut down.
    #[error("dispatcher is closed")]
    DispatcherClosed,

    /// The completion slot was dropped without a result.
    #[error("operation abandoned before completion")]
    OperationAbandoned,

    /// Configuration failed validation.
    #[error("config error: {0}")]
    Config(String),

    // =========================================================================
    // Explicit (transactional) batch errors
    // =========================================================================
    /// The explicit batch cannot be executed as declared.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// The explicit batch does not fit in one request.
    #[error("batch too large: only {packed} of {total} operations fit in one request")]
    BatchTooLarge {
        /// Operations that fit
        packed: usize,
        /// Operations declared
        total: usize,
    },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Returns true for errors that indicate a broken dispatch invariant.
    pub fn is_protocol_defect(&self) -> bool {
        matches!(
            self,
            Error::WrongBatcher { .. } | Error::ContextAlreadyResolved
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
