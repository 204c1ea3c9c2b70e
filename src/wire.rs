//! # Wire Message Shapes
//!
//! Plain-struct request and response shapes for the three RPCs the scheduler
//! issues: `batch_write`, `commit`, and `begin_transaction`. The transport
//! implementor owns the actual encoding; this crate only builds and consumes
//! these shapes.
//!
//! The `writes` array of a request and the `write_results` / `statuses`
//! arrays of a response are index-aligned: result *i* belongs to write *i*.

use std::collections::BTreeMap;

use crate::error::StatusCode;
use crate::types::{DocumentPath, Precondition, Timestamp, Value};

// =============================================================================
// Writes
// =============================================================================

/// One mutation on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    /// What the write does to the document.
    pub operation: WriteOp,
    /// For update-shaped writes: the field paths the server should replace,
    /// leaving omitted fields untouched. Absent means full replace.
    pub update_mask: Option<DocumentMask>,
    /// Server-computed field mutations applied after the write.
    pub update_transforms: Vec<FieldTransform>,
    /// Assertion the server checks before applying the write.
    pub current_document: Option<Precondition>,
}

/// The mutation payload of a [`Write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or replace (subject to the mask) the document's fields.
    Update(Document),
    /// Delete the document.
    Delete(DocumentPath),
}

/// A document's wire form: its resource name and fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Canonical resource name.
    pub name: DocumentPath,
    /// Field values. Sentinel [`Value`] variants never appear here; the
    /// serializer lifts them out before the document reaches the wire.
    pub fields: BTreeMap<String, Value>,
}

/// A set of field paths, in canonical dotted form.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMask {
    /// Sorted canonical field paths.
    pub field_paths: Vec<String>,
}

/// A server-computed mutation of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldTransform {
    /// Canonical dotted path of the transformed field.
    pub field_path: String,
    /// The transformation to apply.
    pub transform: TransformKind,
}

/// The supported server-side transformations.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformKind {
    /// Set the field to the server's request time.
    RequestTime,
    /// Add the operand (integer or double) to the field.
    Increment(Value),
    /// Union the elements into the array field.
    ArrayUnion(Vec<Value>),
    /// Remove the elements from the array field.
    ArrayRemove(Vec<Value>),
}

// =============================================================================
// Per-write Results
// =============================================================================

/// The backend's per-write status.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// The status code; [`StatusCode::Ok`] means the write applied.
    pub code: StatusCode,
    /// Human-readable detail for non-OK codes.
    pub message: String,
}

impl Status {
    /// The success status.
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    /// A non-OK status with a message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The backend's per-write result.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResultProto {
    /// The time the write applied. May be absent for failed writes in bulk
    /// mode; in commit mode an absent time falls back to the commit time.
    pub update_time: Option<Timestamp>,
}

// =============================================================================
// RPC Requests and Responses
// =============================================================================

/// Request for the non-atomic bulk RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteRequest {
    /// The database resource name.
    pub database: String,
    /// The writes, in enqueue order.
    pub writes: Vec<Write>,
}

/// Response of the bulk RPC: parallel arrays index-aligned with the request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteResponse {
    /// Per-write results.
    pub write_results: Vec<WriteResultProto>,
    /// Per-write statuses.
    pub statuses: Vec<Status>,
}

/// Request for the atomic commit RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    /// The database resource name.
    pub database: String,
    /// The writes, in enqueue order.
    pub writes: Vec<Write>,
    /// Transaction id obtained from `begin_transaction`, if the commit runs
    /// transactionally.
    pub transaction: Option<Vec<u8>>,
}

/// Response of the commit RPC. The commit is all-or-nothing: this response
/// only exists if every write applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResponse {
    /// Per-write results.
    pub write_results: Vec<WriteResultProto>,
    /// The transaction commit time; the fallback write time for writes
    /// without their own update time.
    pub commit_time: Timestamp,
}

/// Request to open a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct BeginTransactionRequest {
    /// The database resource name.
    pub database: String,
}

/// Response carrying the opaque transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct BeginTransactionResponse {
    /// Opaque transaction id to pass to `commit`.
    pub transaction: Vec<u8>,
}
