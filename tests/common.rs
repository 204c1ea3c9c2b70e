#![allow(dead_code)]

//! Shared test helpers: a scriptable mock transport with an optional
//! dispatch gate, and builders for test data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use bulkwrite::wire::{
    BatchWriteRequest, BatchWriteResponse, BeginTransactionRequest, BeginTransactionResponse,
    CommitRequest, CommitResponse, Status, WriteResultProto,
};
use bulkwrite::{Error, Result, StatusCode, Timestamp, Transport, Value};

/// Mock transport for the scheduler tests.
///
/// `batch_write` records the request, then (if the transport is gated)
/// waits for one [`MockTransport::release`] permit before responding.
/// Responses pop from the scripted queue; an empty queue answers every
/// write with OK at `(1, 0)`.
pub struct MockTransport {
    gated: bool,
    gate: Semaphore,
    prefer_transactions: bool,
    last_success: Mutex<Option<u64>>,
    bulk_responses: Mutex<VecDeque<Result<BatchWriteResponse>>>,
    bulk_requests: Mutex<Vec<BatchWriteRequest>>,
    commit_requests: Mutex<Vec<CommitRequest>>,
    begin_calls: Mutex<usize>,
    fail_next_commit: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::build(false, false, None)
    }

    /// A transport whose `batch_write` blocks until [`release`]d, so tests
    /// can observe which RPCs have started.
    ///
    /// [`release`]: MockTransport::release
    pub fn gated() -> Arc<Self> {
        Self::build(true, false, None)
    }

    /// A transport preferring transactional commits, reporting the given
    /// last-success time.
    pub fn transactional(last_success: Option<u64>) -> Arc<Self> {
        Self::build(false, true, last_success)
    }

    fn build(gated: bool, prefer_transactions: bool, last_success: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            gated,
            gate: Semaphore::new(0),
            prefer_transactions,
            last_success: Mutex::new(last_success),
            bulk_responses: Mutex::new(VecDeque::new()),
            bulk_requests: Mutex::new(Vec::new()),
            commit_requests: Mutex::new(Vec::new()),
            begin_calls: Mutex::new(0),
            fail_next_commit: AtomicBool::new(false),
        })
    }

    /// Lets one gated `batch_write` proceed.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Scripts the response for the next `batch_write`.
    pub fn push_bulk_response(&self, response: Result<BatchWriteResponse>) {
        self.bulk_responses.lock().unwrap().push_back(response);
    }

    /// Number of `batch_write` calls that have started.
    pub fn bulk_started(&self) -> usize {
        self.bulk_requests.lock().unwrap().len()
    }

    /// The recorded `batch_write` requests.
    pub fn bulk_requests(&self) -> Vec<BatchWriteRequest> {
        self.bulk_requests.lock().unwrap().clone()
    }

    /// The recorded commit requests.
    pub fn commit_requests(&self) -> Vec<CommitRequest> {
        self.commit_requests.lock().unwrap().clone()
    }

    pub fn begin_calls(&self) -> usize {
        *self.begin_calls.lock().unwrap()
    }

    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn batch_write(&self, request: BatchWriteRequest) -> Result<BatchWriteResponse> {
        let count = request.writes.len();
        self.bulk_requests.lock().unwrap().push(request);
        if self.gated {
            self.gate.acquire().await.expect("gate closed").forget();
        }
        let scripted = self.bulk_responses.lock().unwrap().pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(ok_response(count)),
        }
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        let count = request.writes.len();
        self.commit_requests.lock().unwrap().push(request);
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(Error::rpc(StatusCode::Unavailable, "connection reset"));
        }
        Ok(CommitResponse {
            write_results: vec![WriteResultProto { update_time: None }; count],
            commit_time: Timestamp::new(10, 0),
        })
    }

    async fn begin_transaction(
        &self,
        _request: BeginTransactionRequest,
    ) -> Result<BeginTransactionResponse> {
        *self.begin_calls.lock().unwrap() += 1;
        Ok(BeginTransactionResponse {
            transaction: vec![0xAB, 0xCD],
        })
    }

    fn prefer_transactions(&self) -> bool {
        self.prefer_transactions
    }

    fn last_successful_request_millis(&self) -> Option<u64> {
        *self.last_success.lock().unwrap()
    }
}

/// A response where every write succeeded at `(1, 0)`.
pub fn ok_response(count: usize) -> BatchWriteResponse {
    BatchWriteResponse {
        write_results: vec![
            WriteResultProto {
                update_time: Some(Timestamp::new(1, 0)),
            };
            count
        ],
        statuses: vec![Status::ok(); count],
    }
}

/// A single-write response with the given update time.
pub fn ok_response_at(seconds: i64, nanos: i32) -> BatchWriteResponse {
    BatchWriteResponse {
        write_results: vec![WriteResultProto {
            update_time: Some(Timestamp::new(seconds, nanos)),
        }],
        statuses: vec![Status::ok()],
    }
}

/// A single-write response failing with the given code.
pub fn failed_response(code: StatusCode, message: &str) -> BatchWriteResponse {
    BatchWriteResponse {
        write_results: vec![WriteResultProto { update_time: None }],
        statuses: vec![Status::new(code, message)],
    }
}

/// Simple one-field test payload.
pub fn data(value: &str) -> Value {
    Value::map([("foo", Value::from(value))])
}

/// Polls until `f` returns `Some`, or panics after `timeout`.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
