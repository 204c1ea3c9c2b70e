//! # Transport Seam
//!
//! The scheduler issues three RPCs and reads two connection-policy values;
//! everything else about the network (encoding, authentication, deadlines,
//! wire-level retry) belongs to the [`Transport`] implementor.
//!
//! The trait is object-safe so the writer and the commit coordinator can
//! hold an `Arc<dyn Transport>`; tests plug in a scripted mock.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::Result;
use crate::wire::{
    BatchWriteRequest, BatchWriteResponse, BeginTransactionRequest, BeginTransactionResponse,
    CommitRequest, CommitResponse,
};

/// The RPC surface the scheduler depends on.
///
/// Implementations must be shareable across tasks; the scheduler dispatches
/// batches from spawned tasks holding clones of the same `Arc`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Non-atomic bulk write: per-write success or failure.
    async fn batch_write(&self, request: BatchWriteRequest) -> Result<BatchWriteResponse>;

    /// Atomic commit: either every write applies or the call fails.
    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse>;

    /// Opens a transaction and returns its opaque id.
    async fn begin_transaction(
        &self,
        request: BeginTransactionRequest,
    ) -> Result<BeginTransactionResponse>;

    /// Whether long-idle commits should be wrapped in a transaction.
    ///
    /// Static policy of the connection; consulted by the commit coordinator
    /// together with [`Transport::last_successful_request_millis`].
    fn prefer_transactions(&self) -> bool;

    /// Wall-clock milliseconds of the last successful RPC on this
    /// connection, or `None` if nothing has succeeded yet.
    fn last_successful_request_millis(&self) -> Option<u64>;
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Used by the commit coordinator's idleness check against
/// [`Transport::last_successful_request_millis`].
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
