//! # BulkWrite - Bulk Write Scheduler for a Remote Document Database
//!
//! BulkWrite turns an unbounded stream of single-document mutations into
//! bounded, concurrently dispatched RPC batches, returning each caller its
//! own result. It provides:
//!
//! - **Bulk mode**: non-atomic `batch_write` batches with per-write
//!   success or failure
//! - **Commit mode**: atomic all-or-nothing commits, transactionally
//!   wrapped when the connection has gone idle
//! - **Per-document ordering**: writes to the same document are applied in
//!   enqueue order, with at most one in flight at a time
//! - **Deferred serialization**: each operation carries a pure thunk
//!   projected to wire form at send time
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Callers                                │
//! │           (create / set / update / delete / flush)              │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         BulkWriter                              │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  Serializer  │  │  Batch Queue │  │  Dispatcher          │   │
//! │  │  (validate + │  │  (placement  │  │  (in-flight cap,     │   │
//! │  │   project)   │  │   rules)     │  │   conflict gate)     │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │ one RPC per batch
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Transport (trait)                           │
//! │          batch_write  /  commit  /  begin_transaction           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`CommitCoordinator`] shares the batch machinery but routes through
//! the atomic `commit` RPC.
//!
//! ## Core Invariants
//!
//! 1. **Unique document per batch**: a batch holds at most one write per
//!    document path
//! 2. **Monotonic batch state**: `Open → ReadyToSend → Sent`, never
//!    backwards
//! 3. **Single flight per document**: two batches writing the same document
//!    are never in flight simultaneously
//! 4. **Result pairing**: the *i*-th operation's result derives solely from
//!    the *i*-th response entry
//! 5. **Closure**: after `close()` resolves, every enqueued operation has
//!    resolved exactly once
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulkwrite::{BulkWriter, Value};
//!
//! let writer = BulkWriter::new(transport, "projects/p/databases/d");
//! let pending = writer.set(
//!     "projects/p/databases/d/documents/users/alice",
//!     Value::map([("name", Value::from("Alice"))]),
//!     None,
//! )?;
//! writer.flush().await?;
//! let result = pending.await?;
//! println!("written at {}", result.write_time);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types and RPC status codes.
pub mod error;

/// Domain types: document paths, field paths, timestamps, values,
/// preconditions, write results.
pub mod types;

/// Wire shapes for the three RPCs.
pub mod wire;

/// User-data validation and deferred wire projection.
pub mod serializer;

/// The async transport seam.
pub mod transport;

/// Write batches: accumulation, one-shot send, result distribution.
pub mod batch;

/// The bulk dispatch engine.
pub mod writer;

/// The atomic commit coordinator.
pub mod commit;

// =============================================================================
// Re-exports
// =============================================================================

pub use batch::{BatchState, WriteBatch, WriteKind, WriteOperation, WriteResultFuture, MAX_BATCH_SIZE};
pub use commit::{CommitCoordinator, GCF_IDLE_TIMEOUT_MS};
pub use error::{Error, Result, StatusCode};
pub use serializer::{PendingWrite, Serializer, SetOptions};
pub use transport::Transport;
pub use types::{
    DocumentPath, FieldPath, Precondition, Timestamp, Value, WriteResult,
};
pub use writer::{BulkWriter, BulkWriterOptions};
