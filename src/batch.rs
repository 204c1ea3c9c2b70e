//! # Write Batches
//!
//! A [`WriteBatch`] accumulates up to `max_size` writes for distinct
//! documents and issues exactly one RPC. Each contained operation owns a
//! single-use result channel; the batch resolves every operation with its
//! own outcome when the response arrives.
//!
//! ## States
//!
//! ```text
//!        append(full)         send() start        response / error
//! Open ────────────────► ReadyToSend ─────────► Sent ──────────► completion
//!   │                         ▲
//!   └── mark_ready_to_send() ─┘
//! ```
//!
//! Transitions are monotonic. Once a batch is `Sent` it is never reused;
//! the commit coordinator rebuilds a fresh batch from the surviving
//! operations when a caller retries.
//!
//! ## Result distribution
//!
//! The response arrays are index-aligned with the request's `writes` array,
//! which is in append order. In bulk mode each index succeeds or fails
//! independently and a failed RPC rejects the whole batch. In commit mode
//! the commit time is the fallback write time; a failed RPC is handed back
//! to the coordinator with every operation left unresolved, because the
//! coordinator may retry the commit and the retry's outcome is what the
//! operation futures must observe.
//!
//! Serialization is deferred: each operation carries a pure thunk invoked at
//! send time, so the projection sees the final data shape and retry can
//! serialize again.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result, StatusCode};
use crate::serializer::PayloadFn;
use crate::transport::Transport;
use crate::types::{DocumentPath, WriteResult};
use crate::wire::{BatchWriteRequest, BatchWriteResponse, CommitRequest, Write};

// =============================================================================
// Configuration
// =============================================================================

/// Maximum writes per batch.
///
/// The backend caps one RPC at this many writes; the scheduler seals a
/// batch that reaches it.
pub const MAX_BATCH_SIZE: usize = 500;

// =============================================================================
// Operations
// =============================================================================

/// The kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Set,
    Update,
    Delete,
}

/// One enqueued mutation: its kind, target document, deferred wire
/// projection, and the sending half of its result channel.
///
/// Created at enqueue time, never mutated, resolved exactly once by the
/// batch that sends it.
pub struct WriteOperation {
    kind: WriteKind,
    document_path: DocumentPath,
    payload: PayloadFn,
    result: Option<oneshot::Sender<Result<WriteResult>>>,
}

impl WriteOperation {
    /// Creates an operation and the caller-facing future for its result.
    pub fn new(
        kind: WriteKind,
        document_path: DocumentPath,
        payload: PayloadFn,
    ) -> (Self, WriteResultFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind,
                document_path,
                payload,
                result: Some(tx),
            },
            WriteResultFuture { receiver: rx },
        )
    }

    /// The operation's kind.
    pub fn kind(&self) -> WriteKind {
        self.kind
    }

    /// The document this operation targets.
    pub fn document_path(&self) -> &DocumentPath {
        &self.document_path
    }

    fn resolve(&mut self, result: Result<WriteResult>) {
        if let Some(tx) = self.result.take() {
            // The caller may have dropped its future; that only discards
            // the result.
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOperation")
            .field("kind", &self.kind)
            .field("document_path", &self.document_path)
            .finish_non_exhaustive()
    }
}

/// The caller's handle on one write's outcome.
///
/// Resolves exactly once, with the write time on success or the
/// per-operation error on failure.
pub struct WriteResultFuture {
    receiver: oneshot::Receiver<Result<WriteResult>>,
}

impl Future for WriteResultFuture {
    type Output = Result<WriteResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(Error::ResultDropped),
        })
    }
}

// =============================================================================
// Batch
// =============================================================================

/// Lifecycle of a batch. Transitions only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Accepting operations.
    Open,
    /// Sealed; waiting for the dispatcher.
    ReadyToSend,
    /// RPC issued (or finished). Terminal.
    Sent,
}

/// One RPC's worth of operations for distinct documents.
pub struct WriteBatch {
    state: BatchState,
    max_size: usize,
    operations: Vec<WriteOperation>,
    doc_paths: HashSet<DocumentPath>,
    completion_tx: watch::Sender<bool>,
    completion_rx: watch::Receiver<bool>,
}

impl WriteBatch {
    /// Creates an empty open batch holding at most `max_size` operations.
    pub fn new(max_size: usize) -> Self {
        assert!(max_size >= 1, "batch size must be at least 1");
        let (completion_tx, completion_rx) = watch::channel(false);
        Self {
            state: BatchState::Open,
            max_size,
            operations: Vec::new(),
            doc_paths: HashSet::new(),
            completion_tx,
            completion_rx,
        }
    }

    /// Rebuilds an open batch around operations taken from a sent batch.
    /// Document paths are distinct by construction of the source batch.
    pub(crate) fn with_operations(max_size: usize, operations: Vec<WriteOperation>) -> Self {
        let mut batch = Self::new(max_size);
        batch.doc_paths = operations
            .iter()
            .map(|op| op.document_path().clone())
            .collect();
        batch.operations = operations;
        if batch.operations.len() >= batch.max_size {
            batch.state = BatchState::ReadyToSend;
        }
        batch
    }

    /// The batch's current state.
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Number of operations in the batch.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True if the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The documents written by this batch.
    pub fn doc_paths(&self) -> &HashSet<DocumentPath> {
        &self.doc_paths
    }

    /// True if the batch already writes this document.
    pub fn contains(&self, path: &DocumentPath) -> bool {
        self.doc_paths.contains(path)
    }

    /// A receiver that observes `true` once every operation's result has
    /// been distributed. Cloneable; any number of flush waiters may hold
    /// one.
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completion_rx.clone()
    }

    /// Appends an operation.
    ///
    /// Fails with [`Error::AlreadyCommitted`] unless the batch is open and
    /// with [`Error::DuplicateDocument`] if the batch already writes the
    /// operation's document. Filling the batch seals it.
    pub fn append(&mut self, op: WriteOperation) -> Result<()> {
        if self.state != BatchState::Open {
            return Err(Error::AlreadyCommitted);
        }
        if self.contains(op.document_path()) {
            return Err(Error::DuplicateDocument {
                path: op.document_path().as_str().to_string(),
            });
        }
        self.doc_paths.insert(op.document_path().clone());
        self.operations.push(op);
        if self.operations.len() >= self.max_size {
            self.state = BatchState::ReadyToSend;
        }
        Ok(())
    }

    /// Seals the batch. Idempotent; a no-op once the batch left `Open`.
    pub fn mark_ready_to_send(&mut self) {
        if self.state == BatchState::Open {
            self.state = BatchState::ReadyToSend;
        }
    }

    /// Moves the operations out, for rebuilding a retry batch.
    pub(crate) fn take_operations(&mut self) -> Vec<WriteOperation> {
        self.doc_paths.clear();
        std::mem::take(&mut self.operations)
    }

    /// Invokes every operation's payload thunk, in append order, attaching
    /// preconditions.
    fn serialize_writes(&self) -> Vec<Write> {
        self.operations
            .iter()
            .map(|op| {
                let pending = (op.payload)();
                let mut write = pending.write;
                if let Some(precondition) = pending.precondition {
                    write.current_document = Some(precondition);
                }
                write
            })
            .collect()
    }

    // =========================================================================
    // Bulk mode
    // =========================================================================

    /// Sends the batch through the non-atomic bulk RPC and distributes
    /// per-index results.
    ///
    /// Requires the batch to be sealed; the dispatcher guarantees this.
    /// Every failure mode resolves every operation, so the returned
    /// completion signal always fires.
    pub(crate) async fn send_bulk(&mut self, transport: &dyn Transport, database: &str) {
        if self.state != BatchState::ReadyToSend {
            warn!(state = ?self.state, "refusing to send batch that is not ready");
            return;
        }
        self.state = BatchState::Sent;

        let request = BatchWriteRequest {
            database: database.to_string(),
            writes: self.serialize_writes(),
        };
        debug!(ops = self.operations.len(), "dispatching batch_write");

        match transport.batch_write(request).await {
            Ok(response) => self.distribute_bulk(response),
            Err(err) => {
                warn!(error = %err, ops = self.operations.len(), "batch_write rpc failed");
                self.reject_all(err);
            }
        }

        let _ = self.completion_tx.send(true);
    }

    fn distribute_bulk(&mut self, response: BatchWriteResponse) {
        let count = self.operations.len();
        if response.write_results.len() != count || response.statuses.len() != count {
            self.reject_all(Error::rpc(
                StatusCode::Internal,
                "response arrays misaligned with request writes",
            ));
            return;
        }
        for (index, op) in self.operations.iter_mut().enumerate() {
            let status = &response.statuses[index];
            let update_time = response.write_results[index].update_time;
            let result = match update_time {
                Some(write_time) if status.code.is_ok() => Ok(WriteResult::new(write_time)),
                _ => Err(Error::Operation {
                    code: status.code,
                    message: status.message.clone(),
                }),
            };
            op.resolve(result);
        }
    }

    // =========================================================================
    // Commit mode
    // =========================================================================

    /// Sends the batch through the atomic commit RPC.
    ///
    /// On success every operation resolves with its per-index result (the
    /// commit time when the backend reports no per-write time) and the same
    /// results are returned in append order. An RPC-level failure is
    /// returned with every operation still unresolved: the coordinator may
    /// retry the commit, and terminally rejects the operations via
    /// [`WriteBatch::reject_all`] once the caller abandons them.
    pub(crate) async fn send_commit(
        &mut self,
        transport: &dyn Transport,
        database: &str,
        transaction: Option<Vec<u8>>,
    ) -> Result<Vec<WriteResult>> {
        if self.state != BatchState::ReadyToSend {
            return Err(Error::AlreadyCommitted);
        }
        self.state = BatchState::Sent;

        let request = CommitRequest {
            database: database.to_string(),
            writes: self.serialize_writes(),
            transaction,
        };
        debug!(
            ops = self.operations.len(),
            transactional = request.transaction.is_some(),
            "dispatching commit"
        );

        match transport.commit(request).await {
            Ok(response) => {
                let results: Vec<WriteResult> = self
                    .operations
                    .iter()
                    .enumerate()
                    .map(|(index, _)| {
                        let update_time = response
                            .write_results
                            .get(index)
                            .and_then(|r| r.update_time);
                        WriteResult::new(update_time.unwrap_or(response.commit_time))
                    })
                    .collect();
                for (op, result) in self.operations.iter_mut().zip(&results) {
                    op.resolve(Ok(*result));
                }
                let _ = self.completion_tx.send(true);
                Ok(results)
            }
            Err(err) => {
                warn!(error = %err, ops = self.operations.len(), "commit rpc failed");
                Err(err)
            }
        }
    }

    /// Terminally rejects every unresolved operation with the same error.
    ///
    /// Used by the bulk path when the RPC fails, and by the commit
    /// coordinator once a failed commit will not be retried.
    pub(crate) fn reject_all(&mut self, err: Error) {
        for op in &mut self.operations {
            op.resolve(Err(err.clone()));
        }
    }
}

impl fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBatch")
            .field("state", &self.state)
            .field("len", &self.operations.len())
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
