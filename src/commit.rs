//! # Commit Coordinator
//!
//! The all-or-nothing path. Operations accumulate in a single
//! [`WriteBatch`] under the same append contract as the bulk path, but the
//! batch is sent through the atomic `commit` RPC: either every write
//! applies, or the whole commit fails.
//!
//! ## Why wrap idle commits in a transaction?
//!
//! The hosting function environment tears down TCP connections after
//! roughly two minutes of idleness. A non-transactional commit that dies to
//! a connection reset cannot be retried safely: the writes may already
//! have applied. When the connection prefers transactions and has been idle
//! longer than [`GCF_IDLE_TIMEOUT_MS`], the coordinator first opens a
//! transaction and commits under its id, which makes the commit idempotent
//! under reset. This is a pre-commit policy, not a retry loop; retries
//! belong to the transport or the caller.

use std::sync::Arc;

use tracing::debug;

use crate::batch::{BatchState, WriteBatch, WriteKind, WriteOperation, WriteResultFuture, MAX_BATCH_SIZE};
use crate::error::{Error, Result};
use crate::serializer::{PayloadFn, Serializer, SetOptions};
use crate::transport::{now_millis, Transport};
use crate::types::{DocumentPath, FieldPath, Precondition, Value, WriteResult};
use crate::wire::BeginTransactionRequest;

/// Idle threshold beyond which a commit is wrapped in a transaction.
///
/// Slightly under the hosting environment's ~120 s idle connection
/// teardown.
pub const GCF_IDLE_TIMEOUT_MS: u64 = 110_000;

// =============================================================================
// Coordinator
// =============================================================================

/// Accumulates writes and commits them atomically.
///
/// `commit` marks the coordinator committed: further appends fail, but the
/// commit routine may run again. A failed commit returns its error while
/// leaving every operation future pending, so a re-entered commit resolves
/// the original futures with the retry's outcome. The futures are
/// terminally rejected with the failed attempt's error only once the
/// caller abandons the attempt, by calling [`CommitCoordinator::reset`] or
/// dropping the coordinator. Each operation future therefore resolves
/// exactly once, with the final outcome.
pub struct CommitCoordinator {
    transport: Arc<dyn Transport>,
    serializer: Serializer,
    database: String,
    batch: WriteBatch,
    committed: bool,
    /// Error of the most recent failed commit attempt, pending terminal
    /// rejection of the operation futures at reset or drop.
    last_error: Option<Error>,
}

impl CommitCoordinator {
    /// Creates an empty coordinator for the given database.
    pub fn new(transport: Arc<dyn Transport>, database: impl Into<String>) -> Self {
        Self {
            transport,
            serializer: Serializer::new(),
            database: database.into(),
            batch: WriteBatch::new(MAX_BATCH_SIZE),
            committed: false,
            last_error: None,
        }
    }

    /// Number of accumulated operations.
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// True if no operations have been accumulated.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    // =========================================================================
    // Enqueue surface
    // =========================================================================

    /// Appends a document create.
    pub fn create(
        &mut self,
        path: impl Into<DocumentPath>,
        data: Value,
    ) -> Result<WriteResultFuture> {
        let path = path.into();
        let payload = self.serializer.serialize_create(&path, &data)?;
        self.append(WriteKind::Create, path, payload)
    }

    /// Appends a document set.
    pub fn set(
        &mut self,
        path: impl Into<DocumentPath>,
        data: Value,
        options: Option<SetOptions>,
    ) -> Result<WriteResultFuture> {
        let path = path.into();
        let payload = self.serializer.serialize_set(&path, &data, options)?;
        self.append(WriteKind::Set, path, payload)
    }

    /// Appends a field update.
    pub fn update(
        &mut self,
        path: impl Into<DocumentPath>,
        updates: Vec<(FieldPath, Value)>,
        precondition: Option<Precondition>,
    ) -> Result<WriteResultFuture> {
        let path = path.into();
        let payload = self
            .serializer
            .serialize_update(&path, &updates, precondition)?;
        self.append(WriteKind::Update, path, payload)
    }

    /// Appends a document delete.
    pub fn delete(
        &mut self,
        path: impl Into<DocumentPath>,
        precondition: Option<Precondition>,
    ) -> Result<WriteResultFuture> {
        let path = path.into();
        let payload = self.serializer.serialize_delete(&path, precondition)?;
        self.append(WriteKind::Delete, path, payload)
    }

    fn append(
        &mut self,
        kind: WriteKind,
        path: DocumentPath,
        payload: PayloadFn,
    ) -> Result<WriteResultFuture> {
        if self.committed {
            return Err(Error::AlreadyCommitted);
        }
        let (op, future) = WriteOperation::new(kind, path, payload);
        self.batch.append(op)?;
        Ok(future)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commits every accumulated write atomically.
    ///
    /// Returns the write results in append order. An empty coordinator
    /// resolves immediately without an RPC. On failure the operation
    /// futures stay pending: calling `commit` again retries the same
    /// operations and resolves them with the retry's outcome, while
    /// [`CommitCoordinator::reset`] (or dropping the coordinator) rejects
    /// them with the failed attempt's error.
    pub async fn commit(&mut self) -> Result<Vec<WriteResult>> {
        self.commit_inner(None).await
    }

    /// Commits under an explicit transaction id, skipping the idleness
    /// policy.
    pub async fn commit_with_transaction(
        &mut self,
        transaction_id: Vec<u8>,
    ) -> Result<Vec<WriteResult>> {
        self.commit_inner(Some(transaction_id)).await
    }

    /// Clears the operations and the committed flag, enabling reuse across
    /// a caller-owned retry loop. Operation futures still pending from a
    /// failed attempt are rejected with that attempt's error before the
    /// operations are dropped.
    pub fn reset(&mut self) {
        self.reject_pending();
        self.batch = WriteBatch::new(MAX_BATCH_SIZE);
        self.committed = false;
    }

    async fn commit_inner(&mut self, transaction: Option<Vec<u8>>) -> Result<Vec<WriteResult>> {
        self.committed = true;
        if self.batch.is_empty() {
            return Ok(Vec::new());
        }

        // Re-entry after a failed attempt: the sent batch cannot be reused,
        // so rebuild a fresh one around the surviving operations. Their
        // result channels are still pending and the thunks are pure, so the
        // retry serializes again and resolves the original futures.
        if self.batch.state() == BatchState::Sent {
            let operations = self.batch.take_operations();
            self.batch = WriteBatch::with_operations(MAX_BATCH_SIZE, operations);
        }

        let outcome = self.run_commit(transaction).await;
        match &outcome {
            Ok(_) => self.last_error = None,
            Err(err) => self.last_error = Some(err.clone()),
        }
        outcome
    }

    async fn run_commit(&mut self, transaction: Option<Vec<u8>>) -> Result<Vec<WriteResult>> {
        let transaction = match transaction {
            Some(id) => Some(id),
            None if self.should_run_transactionally() => {
                debug!("idle connection, wrapping commit in a transaction");
                let response = self
                    .transport
                    .begin_transaction(BeginTransactionRequest {
                        database: self.database.clone(),
                    })
                    .await?;
                Some(response.transaction)
            }
            None => None,
        };

        self.batch.mark_ready_to_send();
        self.batch
            .send_commit(self.transport.as_ref(), &self.database, transaction)
            .await
    }

    /// Rejects the pending operation futures with the last failed
    /// attempt's error. A no-op when the last attempt succeeded (the
    /// futures are already resolved) or nothing was ever committed.
    fn reject_pending(&mut self) {
        if let Some(err) = self.last_error.take() {
            self.batch.reject_all(err);
        }
    }

    /// True when the transport prefers transactions and the connection has
    /// been idle past the threshold (or has never completed a request).
    fn should_run_transactionally(&self) -> bool {
        if !self.transport.prefer_transactions() {
            return false;
        }
        match self.transport.last_successful_request_millis() {
            None => true,
            Some(last) => now_millis().saturating_sub(last) > GCF_IDLE_TIMEOUT_MS,
        }
    }
}

impl std::fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("database", &self.database)
            .field("ops", &self.batch.len())
            .field("committed", &self.committed)
            .finish()
    }
}

impl Drop for CommitCoordinator {
    fn drop(&mut self) {
        // Abandoning a failed commit is the other way a caller decides not
        // to retry; the pending futures get the attempt's error rather
        // than a dropped-channel error.
        self.reject_pending();
    }
}

// =============================================================================
// Tests
// =============================================================================
