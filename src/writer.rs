//! # Bulk Writer
//!
//! The dispatch engine. Callers enqueue individual writes; the writer
//! groups them into [`WriteBatch`]es, dispatches the batches over the
//! transport with a bounded in-flight count, and hands each caller an
//! independent result future.
//!
//! ```text
//! caller ──create/set/update/delete──► enqueue ──► batch queue
//!                                                    │ head, when ready
//!                                                    ▼ and unblocked
//!                                              dispatcher ──► transport
//!                                                    │
//!                        per-operation results ◄─────┘
//! ```
//!
//! ## Placement rules
//!
//! - Writes land in the trailing `Open` batch; a full batch seals itself
//!   and the next write opens a fresh one.
//! - A second write to a document already in the trailing batch seals that
//!   batch and opens a fresh one. This is the sole mechanism preserving
//!   per-document ordering.
//! - The dispatcher only launches the queue head, and only when none of its
//!   documents are in a sent-but-incomplete batch. Together with head-order
//!   dispatch this keeps at most one in-flight write per document.
//!
//! ## Invariants
//!
//! - Only the trailing queue batch can be `Open`; queued batches are never
//!   empty.
//! - `in_flight` never exceeds `max_concurrent_batches`.
//! - All scheduler state lives behind one mutex, never held across an
//!   `.await`; RPC sends run in spawned tasks that re-enter the lock only
//!   to record completion and re-kick the dispatcher.
//!
//! ## Failure semantics
//!
//! A per-operation failure surfaces through that operation's future only.
//! An RPC-level failure rejects every operation in its batch but leaves the
//! writer usable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::watch;
use tracing::debug;

use crate::batch::{BatchState, WriteBatch, WriteKind, WriteOperation, WriteResultFuture, MAX_BATCH_SIZE};
use crate::error::{Error, Result};
use crate::serializer::{Serializer, SetOptions};
use crate::transport::Transport;
use crate::types::{DocumentPath, FieldPath, Precondition, Value};

// =============================================================================
// Options
// =============================================================================

/// Tuning knobs for a [`BulkWriter`].
#[derive(Debug, Clone)]
pub struct BulkWriterOptions {
    /// Maximum writes per batch. Defaults to [`MAX_BATCH_SIZE`].
    pub max_batch_size: usize,
    /// Maximum batches with an outstanding RPC. Defaults to 1, which makes
    /// "only one RPC runs at a time" an observable property.
    pub max_concurrent_batches: usize,
}

impl Default for BulkWriterOptions {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
            max_concurrent_batches: 1,
        }
    }
}

// =============================================================================
// Scheduler State
// =============================================================================

/// Mutable scheduler bookkeeping, guarded by the writer's mutex.
struct SchedulerState {
    /// Batches not yet dispatched. Only the last may be `Open`.
    queue: VecDeque<WriteBatch>,
    /// Documents in sent-but-incomplete batches, refcounted so overlapping
    /// completions decrement correctly.
    sent_docs: HashMap<DocumentPath, usize>,
    /// Completion receivers of sent-but-incomplete batches, for flush.
    sent_completions: Vec<watch::Receiver<bool>>,
    /// Batches with an outstanding RPC.
    in_flight: usize,
    /// Once true, enqueue and flush fail.
    closed: bool,
}

struct WriterInner {
    transport: Arc<dyn Transport>,
    serializer: Serializer,
    database: String,
    max_batch_size: usize,
    max_concurrent_batches: usize,
    state: Mutex<SchedulerState>,
}

impl WriterInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("scheduler state lock poisoned")
    }

    /// Launches dispatchable batches: while below the in-flight cap and the
    /// queue head is sealed and free of conflicts with sent documents, pop
    /// it and send. Re-invoked after every enqueue, flush, and completion.
    fn kick(self: Arc<Self>) {
        let mut state = self.state();
        while state.in_flight < self.max_concurrent_batches {
            let dispatchable = match state.queue.front() {
                Some(head) => {
                    head.state() == BatchState::ReadyToSend
                        && !head.doc_paths().iter().any(|p| state.sent_docs.contains_key(p))
                }
                None => false,
            };
            if !dispatchable {
                break;
            }

            let mut batch = match state.queue.pop_front() {
                Some(batch) => batch,
                None => break,
            };
            for path in batch.doc_paths() {
                *state.sent_docs.entry(path.clone()).or_insert(0) += 1;
            }
            state.in_flight += 1;
            state.sent_completions.push(batch.completion());
            debug!(ops = batch.len(), in_flight = state.in_flight, "launching batch");

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                batch.send_bulk(inner.transport.as_ref(), &inner.database).await;
                inner.complete(&batch);
                inner.kick();
            });
        }
    }

    /// Records a finished batch: releases its documents, frees an in-flight
    /// slot, and prunes completed flush receivers.
    fn complete(&self, batch: &WriteBatch) {
        let mut state = self.state();
        for path in batch.doc_paths() {
            if let Some(count) = state.sent_docs.get_mut(path) {
                *count -= 1;
                if *count == 0 {
                    state.sent_docs.remove(path);
                }
            }
        }
        state.in_flight -= 1;
        state.sent_completions.retain(|rx| !*rx.borrow());
        debug!(in_flight = state.in_flight, "batch completed");
    }
}

// =============================================================================
// Bulk Writer
// =============================================================================

/// Schedules an unbounded stream of single-document writes into bounded,
/// concurrently dispatched batches.
///
/// Cloneable; clones share the same scheduler. Requires a tokio runtime:
/// batch RPCs run in spawned tasks.
#[derive(Clone)]
pub struct BulkWriter {
    inner: Arc<WriterInner>,
}

impl BulkWriter {
    /// Creates a writer with default options.
    pub fn new(transport: Arc<dyn Transport>, database: impl Into<String>) -> Self {
        Self::with_options(transport, database, BulkWriterOptions::default())
    }

    /// Creates a writer with explicit options.
    pub fn with_options(
        transport: Arc<dyn Transport>,
        database: impl Into<String>,
        options: BulkWriterOptions,
    ) -> Self {
        assert!(options.max_batch_size >= 1, "batch size must be at least 1");
        assert!(
            options.max_concurrent_batches >= 1,
            "concurrency must be at least 1"
        );
        Self {
            inner: Arc::new(WriterInner {
                transport,
                serializer: Serializer::new(),
                database: database.into(),
                max_batch_size: options.max_batch_size,
                max_concurrent_batches: options.max_concurrent_batches,
                state: Mutex::new(SchedulerState {
                    queue: VecDeque::new(),
                    sent_docs: HashMap::new(),
                    sent_completions: Vec::new(),
                    in_flight: 0,
                    closed: false,
                }),
            }),
        }
    }

    // =========================================================================
    // Enqueue surface
    // =========================================================================

    /// Enqueues a document create. Fails at the backend if the document
    /// already exists.
    ///
    /// Validation errors surface in the returned `Result`; the write's
    /// outcome arrives through the future.
    pub fn create(
        &self,
        path: impl Into<DocumentPath>,
        data: Value,
    ) -> Result<WriteResultFuture> {
        let path = path.into();
        let payload = self.inner.serializer.serialize_create(&path, &data)?;
        self.enqueue(WriteKind::Create, path, payload)
    }

    /// Enqueues a document set (full replace, or merge per `options`).
    pub fn set(
        &self,
        path: impl Into<DocumentPath>,
        data: Value,
        options: Option<SetOptions>,
    ) -> Result<WriteResultFuture> {
        let path = path.into();
        let payload = self.inner.serializer.serialize_set(&path, &data, options)?;
        self.enqueue(WriteKind::Set, path, payload)
    }

    /// Enqueues a field update. Fails at the backend if the document does
    /// not exist.
    pub fn update(
        &self,
        path: impl Into<DocumentPath>,
        updates: Vec<(FieldPath, Value)>,
        precondition: Option<Precondition>,
    ) -> Result<WriteResultFuture> {
        let path = path.into();
        let payload = self
            .inner
            .serializer
            .serialize_update(&path, &updates, precondition)?;
        self.enqueue(WriteKind::Update, path, payload)
    }

    /// Enqueues a document delete.
    pub fn delete(
        &self,
        path: impl Into<DocumentPath>,
        precondition: Option<Precondition>,
    ) -> Result<WriteResultFuture> {
        let path = path.into();
        let payload = self.inner.serializer.serialize_delete(&path, precondition)?;
        self.enqueue(WriteKind::Delete, path, payload)
    }

    /// Places an operation into the right batch and kicks the dispatcher.
    /// Never suspends: it appends under the lock or fails.
    fn enqueue(
        &self,
        kind: WriteKind,
        path: DocumentPath,
        payload: crate::serializer::PayloadFn,
    ) -> Result<WriteResultFuture> {
        let (op, future) = WriteOperation::new(kind, path, payload);
        {
            let mut state = self.inner.state();
            if state.closed {
                return Err(Error::Closed);
            }

            // Seal the trailing batch if it already writes this document;
            // the write then lands in a fresh batch behind it.
            let mut needs_new = true;
            if let Some(current) = state.queue.back_mut() {
                if current.state() == BatchState::Open {
                    if current.contains(op.document_path()) {
                        current.mark_ready_to_send();
                    } else {
                        needs_new = false;
                    }
                }
            }
            if needs_new {
                state.queue.push_back(WriteBatch::new(self.inner.max_batch_size));
            }

            let current = state
                .queue
                .back_mut()
                .expect("queue holds the batch just ensured");
            current.append(op)?;
        }
        Arc::clone(&self.inner).kick();
        Ok(future)
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Seals every open batch and waits for every batch that exists right
    /// now (queued or in flight) to complete. Writes enqueued afterwards
    /// land in fresh batches and are not awaited.
    pub async fn flush(&self) -> Result<()> {
        let completions = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(Error::Closed);
            }
            Self::capture_completions(&mut state)
        };
        Arc::clone(&self.inner).kick();
        Self::await_completions(completions).await;
        Ok(())
    }

    /// Flushes and permanently closes the writer. Subsequent enqueues fail
    /// with [`Error::Closed`], as do subsequent `flush`/`close` calls.
    pub async fn close(&self) -> Result<()> {
        let completions = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(Error::Closed);
            }
            // Closing before the drain keeps the awaited set exact: nothing
            // can be enqueued while the close is in progress.
            state.closed = true;
            Self::capture_completions(&mut state)
        };
        Arc::clone(&self.inner).kick();
        Self::await_completions(completions).await;
        Ok(())
    }

    /// Seals open batches and snapshots the completion receivers of every
    /// outstanding batch.
    fn capture_completions(state: &mut SchedulerState) -> Vec<watch::Receiver<bool>> {
        for batch in state.queue.iter_mut() {
            batch.mark_ready_to_send();
        }
        let mut completions: Vec<watch::Receiver<bool>> =
            state.queue.iter().map(WriteBatch::completion).collect();
        completions.extend(state.sent_completions.iter().cloned());
        completions
    }

    async fn await_completions(completions: Vec<watch::Receiver<bool>>) {
        join_all(completions.into_iter().map(|mut rx| async move {
            while !*rx.borrow_and_update() {
                // A closed channel means the batch was dropped after
                // distributing its results.
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }))
        .await;
    }
}

impl std::fmt::Debug for BulkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("BulkWriter")
            .field("database", &self.inner.database)
            .field("queued_batches", &state.queue.len())
            .field("in_flight", &state.in_flight)
            .field("closed", &state.closed)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::StatusCode;
    use crate::types::Timestamp;
    use crate::wire::{
        BatchWriteRequest, BatchWriteResponse, BeginTransactionRequest,
        BeginTransactionResponse, CommitRequest, CommitResponse, Status, WriteResultProto,
    };

    /// Transport that succeeds every write at a fixed time and records the
    /// requests it served.
    struct EchoTransport {
        requests: StdMutex<Vec<BatchWriteRequest>>,
    }

    impl EchoTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: StdMutex::new(Vec::new()),
            })
        }

        fn request_sizes(&self) -> Vec<usize> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.writes.len())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn batch_write(&self, request: BatchWriteRequest) -> Result<BatchWriteResponse> {
            let count = request.writes.len();
            self.requests.lock().unwrap().push(request);
            Ok(BatchWriteResponse {
                write_results: vec![
                    WriteResultProto {
                        update_time: Some(Timestamp::new(1, 0)),
                    };
                    count
                ],
                statuses: vec![Status::ok(); count],
            })
        }

        async fn commit(&self, _request: CommitRequest) -> Result<CommitResponse> {
            Err(Error::rpc(StatusCode::Unimplemented, "bulk only"))
        }

        async fn begin_transaction(
            &self,
            _request: BeginTransactionRequest,
        ) -> Result<BeginTransactionResponse> {
            Err(Error::rpc(StatusCode::Unimplemented, "bulk only"))
        }

        fn prefer_transactions(&self) -> bool {
            false
        }

        fn last_successful_request_millis(&self) -> Option<u64> {
            None
        }
    }

    fn data() -> Value {
        Value::map([("k", Value::from(1i64))])
    }

    #[tokio::test]
    async fn close_rejects_further_writes_and_flushes() {
        let transport = EchoTransport::new();
        let writer = BulkWriter::new(transport.clone(), "db");

        let rx = writer.set("c/doc", data(), None).unwrap();
        writer.close().await.unwrap();
        rx.await.unwrap();

        assert!(matches!(writer.set("c/doc2", data(), None), Err(Error::Closed)));
        assert!(matches!(writer.flush().await, Err(Error::Closed)));
        assert!(matches!(writer.close().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn same_document_writes_split_into_separate_batches() {
        let transport = EchoTransport::new();
        let writer = BulkWriter::new(transport.clone(), "db");

        let rx1 = writer.set("c/doc", data(), None).unwrap();
        let rx2 = writer
            .update("c/doc", vec![(FieldPath::parse("k").unwrap(), Value::from(2i64))], None)
            .unwrap();
        writer.close().await.unwrap();

        rx1.await.unwrap();
        rx2.await.unwrap();
        assert_eq!(transport.request_sizes(), [1, 1]);
    }

    #[tokio::test]
    async fn distinct_documents_share_a_batch() {
        let transport = EchoTransport::new();
        let writer = BulkWriter::new(transport.clone(), "db");

        let rx1 = writer.set("c/a", data(), None).unwrap();
        let rx2 = writer.set("c/b", data(), None).unwrap();
        writer.close().await.unwrap();

        rx1.await.unwrap();
        rx2.await.unwrap();
        assert_eq!(transport.request_sizes(), [2]);
    }

    #[tokio::test]
    async fn full_batch_seals_and_next_write_opens_a_new_one() {
        let transport = EchoTransport::new();
        let writer = BulkWriter::with_options(
            transport.clone(),
            "db",
            BulkWriterOptions {
                max_batch_size: 2,
                ..BulkWriterOptions::default()
            },
        );

        let mut futures = Vec::new();
        for i in 0..5 {
            futures.push(writer.set(format!("c/doc{}", i), data(), None).unwrap());
        }
        writer.close().await.unwrap();
        for rx in futures {
            rx.await.unwrap();
        }
        assert_eq!(transport.request_sizes(), [2, 2, 1]);
    }

    #[tokio::test]
    async fn flush_on_empty_writer_issues_no_rpc() {
        let transport = EchoTransport::new();
        let writer = BulkWriter::new(transport.clone(), "db");
        writer.flush().await.unwrap();
        assert!(transport.request_sizes().is_empty());
    }

    #[tokio::test]
    async fn validation_failure_enqueues_nothing() {
        let transport = EchoTransport::new();
        let writer = BulkWriter::new(transport.clone(), "db");

        assert!(writer.set("c/doc", Value::from(1i64), None).is_err());
        writer.close().await.unwrap();
        assert!(transport.request_sizes().is_empty());
    }
}
