//! Atomic Commit Tests
//!
//! End-to-end scenarios for the commit coordinator:
//! - Mixed-kind batches serialize in append order with their preconditions
//! - Idle connections commit under a fresh transaction
//! - Failed commits leave operation futures pending for retry; reset
//!   rejects them with the attempt's error and reopens the coordinator

mod common;

use bulkwrite::wire::WriteOp;
use bulkwrite::{
    CommitCoordinator, Error, FieldPath, Precondition, StatusCode, Timestamp, Value,
};
use futures::FutureExt;

use common::MockTransport;

#[tokio::test]
async fn mixed_kinds_commit_in_append_order() {
    let transport = MockTransport::new();
    let mut coordinator = CommitCoordinator::new(transport.clone(), "db");

    let created = coordinator.create("col/a", common::data("1")).unwrap();
    let updated = coordinator
        .update(
            "col/b",
            vec![(FieldPath::parse("foo").unwrap(), Value::from("2"))],
            None,
        )
        .unwrap();
    let deleted = coordinator.delete("col/c", None).unwrap();

    let results = coordinator.commit().await.unwrap();
    assert_eq!(results.len(), 3);
    for result in &results {
        assert_eq!(result.write_time, Timestamp::new(10, 0));
    }
    assert_eq!(created.await.unwrap().write_time, Timestamp::new(10, 0));
    assert_eq!(updated.await.unwrap().write_time, Timestamp::new(10, 0));
    assert_eq!(deleted.await.unwrap().write_time, Timestamp::new(10, 0));

    let requests = transport.commit_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].transaction, None);
    let writes = &requests[0].writes;
    assert_eq!(writes.len(), 3);
    assert_eq!(writes[0].current_document, Some(Precondition::Exists(false)));
    assert_eq!(writes[1].current_document, Some(Precondition::Exists(true)));
    assert_eq!(writes[2].current_document, None);
    assert!(matches!(writes[2].operation, WriteOp::Delete(_)));
}

#[tokio::test]
async fn idle_connection_wraps_commit_in_transaction() {
    // Never-used connection: treated as idle.
    let transport = MockTransport::transactional(None);
    let mut coordinator = CommitCoordinator::new(transport.clone(), "db");
    coordinator.set("col/doc", common::data("v"), None).unwrap();

    coordinator.commit().await.unwrap();

    assert_eq!(transport.begin_calls(), 1);
    let requests = transport.commit_requests();
    assert_eq!(requests[0].transaction, Some(vec![0xAB, 0xCD]));
}

#[tokio::test]
async fn failed_commit_supports_retry_and_reset() {
    let transport = MockTransport::new();
    let mut coordinator = CommitCoordinator::new(transport.clone(), "db");

    let mut a = coordinator.set("col/a", common::data("1"), None).unwrap();
    let mut b = coordinator.set("col/b", common::data("2"), None).unwrap();

    transport.fail_next_commit();
    let err = coordinator.commit().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Rpc {
            code: StatusCode::Unavailable,
            ..
        }
    ));
    // The operation futures are not rejected yet: a re-entered commit may
    // still resolve them.
    assert!((&mut a).now_or_never().is_none());
    assert!((&mut b).now_or_never().is_none());

    // No appends while committed; reset rejects the pending futures with
    // the failed attempt's error and reopens the coordinator.
    assert!(matches!(
        coordinator.set("col/c", common::data("3"), None),
        Err(Error::AlreadyCommitted)
    ));
    coordinator.reset();
    for pending in [a, b] {
        assert!(matches!(
            pending.await.unwrap_err(),
            Error::Rpc {
                code: StatusCode::Unavailable,
                ..
            }
        ));
    }

    coordinator.set("col/a", common::data("1"), None).unwrap();
    let results = coordinator.commit().await.unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn reentered_commit_resolves_original_futures_with_retry_outcome() {
    let transport = MockTransport::new();
    let mut coordinator = CommitCoordinator::new(transport.clone(), "db");

    let a = coordinator.set("col/a", common::data("1"), None).unwrap();
    let b = coordinator.set("col/b", common::data("2"), None).unwrap();

    transport.fail_next_commit();
    coordinator.commit().await.unwrap_err();

    let results = coordinator.commit().await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(a.await.unwrap().write_time, Timestamp::new(10, 0));
    assert_eq!(b.await.unwrap().write_time, Timestamp::new(10, 0));
    assert_eq!(transport.commit_requests().len(), 2);
}
