//! ---
//! dbr_section: "15-testing-qa-runbook"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Tagged asynchronous requests: completion, cancellation, collection."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dbr_broker::{
    DataBroker, DbrError, ErrorCode, Group, MemoryBackend, OpFlags, PersistenceLevel, Resolution,
    Tag, TagPoll, TagState, TupleSelector,
};
use dbr_common::ClientConfig;

fn broker(timeout: Duration, max_tags: usize) -> DataBroker {
    let config = ClientConfig {
        timeout,
        max_outstanding_tags: max_tags,
        ..ClientConfig::default()
    };
    DataBroker::new(Arc::new(MemoryBackend::new()), config, None)
}

async fn wait_resolved(broker: &DataBroker, tag: Tag) -> Resolution {
    for _ in 0..200 {
        match broker.test(tag).expect("tag is known") {
            TagPoll::Resolved(resolution) => return resolution,
            TagPoll::Pending(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("{tag} did not resolve");
}

#[tokio::test]
async fn async_put_then_async_get() {
    let broker = broker(Duration::from_secs(5), 16);
    let g = Group::default();
    let h = broker
        .create("async", PersistenceLevel::VolatileSimple, &[])
        .await
        .unwrap();

    let put = broker.put_a(h, "Hello", "testTup", &g).unwrap();
    assert_eq!(wait_resolved(&broker, put).await, Resolution::Completed(None));

    let get = broker
        .get_a(h, &TupleSelector::exact("testTup"), &g, 128, OpFlags::empty())
        .unwrap();
    assert_eq!(
        wait_resolved(&broker, get).await,
        Resolution::Completed(Some(Bytes::from_static(b"Hello")))
    );

    // collected tags are forgotten
    assert_eq!(broker.test(get), Err(DbrError::Tag(get)));
    assert_eq!(broker.outstanding_tags(), 0);
}

#[tokio::test]
async fn pending_get_reports_in_progress_until_put() {
    let broker = broker(Duration::from_secs(5), 16);
    let g = Group::default();
    let h = broker
        .create("pending", PersistenceLevel::VolatileSimple, &[])
        .await
        .unwrap();

    let get = broker
        .get_a(h, &TupleSelector::exact("later"), &g, 64, OpFlags::empty())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let poll = broker.test(get).unwrap();
    assert!(poll.is_pending());
    assert_eq!(poll.code(), ErrorCode::InProgress);

    broker.put(h, "arrived", "later", &g).await.unwrap();
    assert_eq!(
        wait_resolved(&broker, get).await,
        Resolution::Completed(Some(Bytes::from_static(b"arrived")))
    );
}

#[tokio::test]
async fn async_read_leaves_tuple() {
    let broker = broker(Duration::from_secs(5), 16);
    let g = Group::default();
    let h = broker
        .create("peek", PersistenceLevel::VolatileSimple, &[])
        .await
        .unwrap();
    broker.put(h, "stay", "k", &g).await.unwrap();

    let read = broker
        .read_a(h, &TupleSelector::exact("k"), &g, 16, OpFlags::NOWAIT)
        .unwrap();
    assert_eq!(
        wait_resolved(&broker, read).await,
        Resolution::Completed(Some(Bytes::from_static(b"stay")))
    );
    assert!(broker.test_key(h, "k").await.is_ok());
}

#[tokio::test]
async fn nowait_async_get_fails_unavailable() {
    let broker = broker(Duration::from_secs(5), 16);
    let h = broker
        .create("empty", PersistenceLevel::VolatileSimple, &[])
        .await
        .unwrap();
    let get = broker
        .get_a(h, &TupleSelector::exact("none"), &Group::default(), 16, OpFlags::NOWAIT)
        .unwrap();
    let resolution = wait_resolved(&broker, get).await;
    assert_eq!(resolution.state(), TagState::Failed);
    assert_eq!(resolution.code(), ErrorCode::Unavailable);
}

#[tokio::test]
async fn cancel_pending_get_then_tuple_stays_available() {
    let broker = broker(Duration::from_secs(5), 16);
    let g = Group::default();
    let h = broker
        .create("cancel", PersistenceLevel::VolatileSimple, &[])
        .await
        .unwrap();

    let get = broker
        .get_a(h, &TupleSelector::exact("k"), &g, 16, OpFlags::empty())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.cancel(get).unwrap(), TagState::Cancelled);
    assert_eq!(broker.test(get).unwrap().code(), ErrorCode::Cancelled);

    broker.put(h, "kept", "k", &g).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.test_key(h, "k").await.is_ok());
}

#[tokio::test]
async fn cancel_after_completion_keeps_result() {
    let broker = broker(Duration::from_secs(5), 16);
    let g = Group::default();
    let h = broker
        .create("late-cancel", PersistenceLevel::VolatileSimple, &[])
        .await
        .unwrap();
    let put = broker.put_a(h, "v", "k", &g).unwrap();
    for _ in 0..200 {
        if broker.tag_state(put).unwrap() == TagState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(broker.cancel(put).unwrap(), TagState::Completed);
    assert_eq!(
        broker.test(put).unwrap(),
        TagPoll::Resolved(Resolution::Completed(None))
    );
}

#[tokio::test]
async fn outstanding_tag_capacity_is_enforced() {
    let broker = broker(Duration::ZERO, 2);
    let g = Group::default();
    let h = broker
        .create("cap", PersistenceLevel::VolatileSimple, &[])
        .await
        .unwrap();
    let selector = TupleSelector::exact("never");
    let first = broker.get_a(h, &selector, &g, 8, OpFlags::empty()).unwrap();
    let second = broker.get_a(h, &selector, &g, 8, OpFlags::empty()).unwrap();
    assert_ne!(first, second);

    let err = broker
        .get_a(h, &selector, &g, 8, OpFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TagError);

    broker.cancel(first).unwrap();
    broker.test(first).unwrap();
    let third = broker.get_a(h, &selector, &g, 8, OpFlags::empty()).unwrap();
    assert!(third.value() > second.value());
    broker.cancel(second).unwrap();
    broker.cancel(third).unwrap();
}

#[tokio::test]
async fn async_request_on_unknown_handle_fails_immediately() {
    let broker = broker(Duration::from_secs(1), 4);
    let h = broker
        .create("gone", PersistenceLevel::VolatileSimple, &[])
        .await
        .unwrap();
    broker.detach(h).await.unwrap();
    let err = broker.put_a(h, "x", "k", &Group::default()).unwrap_err();
    assert_eq!(err, DbrError::Handle(h));
    assert_eq!(broker.outstanding_tags(), 0);
}

#[test]
fn async_request_outside_runtime_fails_to_post() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let broker = broker(Duration::from_secs(1), 4);
    let h = runtime
        .block_on(broker.create("outside", PersistenceLevel::VolatileSimple, &[]))
        .unwrap();
    let err = broker
        .get_a(h, &TupleSelector::exact("k"), &Group::default(), 8, OpFlags::NOWAIT)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BackendPost);
}
