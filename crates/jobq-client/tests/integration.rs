//! End-to-end scenarios driving a `Hub` and one or more `Client`s together
//! against a shared `MemoryStore`. The Rust equivalent of the original's
//! `test.cpp` `Fix` fixture (one Hub + one Client sharing a cleared prefix),
//! substituting `MemoryStore` for a live `mongod`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document};
use jobq_client::{Client, Handler};
use jobq_core::Error;
use jobq_hub::Hub;
use jobq_store::{MemoryStore, Store};

fn store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

/// Scenario 4, timeout + retry: a job trips its deadline, the Hub's sweep
/// revives it exactly once, and the second trip is terminal.
///
/// Real-time sleeps are avoided by giving the job a zero-second timeout (so
/// the deadline is the claim's own `book_time`, already passed by the time
/// `checkpoint` runs) and by pausing the Tokio clock so the Hub's sweep
/// interval (an ordinary `tokio::time::sleep`, unrelated to the wall-clock
/// deadline check) can be fast-forwarded with `advance` instead of waited
/// out for real.
#[tokio::test]
async fn timeout_then_one_retry_then_terminal_failed() {
    tokio::time::pause();

    let store = store();
    let hub = Arc::new(Hub::new(Arc::clone(&store), "test.gtest").unwrap());
    hub.insert_job(doc! { "foo": 1 }, Some(0), None)
        .await
        .unwrap();

    let sweep = Arc::clone(&hub).register(Duration::from_millis(5));

    let mut worker = Client::new(Arc::clone(&store), "test.gtest").unwrap();
    worker.claim_next().await.unwrap();
    let first_trip = worker.checkpoint(true).await.unwrap_err();
    assert!(matches!(first_trip, Error::Timeout));
    assert!(!worker.has_claim());

    // Let the sweep observe the FAILED job and revive it (nfailed: 0 -> 1).
    advance_and_settle(Duration::from_millis(50)).await;
    assert_eq!(hub.count_failed().await.unwrap(), 0);
    assert_eq!(hub.count_open().await.unwrap(), 1);

    let mut worker = Client::new(Arc::clone(&store), "test.gtest").unwrap();
    worker.claim_next().await.unwrap();
    let second_trip = worker.checkpoint(true).await.unwrap_err();
    assert!(matches!(second_trip, Error::Timeout));

    // A second sweep pass must NOT revive it again: nfailed is now 1 and the
    // sweep's `nfailed < 1` predicate no longer matches.
    advance_and_settle(Duration::from_millis(50)).await;
    assert_eq!(hub.count_failed().await.unwrap(), 1);
    assert_eq!(hub.count_open().await.unwrap(), 0);

    sweep.request_stop();
    sweep.wait().await;
}

async fn advance_and_settle(duration: Duration) {
    tokio::time::advance(duration).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

struct ImmediateSuccess;

#[async_trait]
impl Handler for ImmediateSuccess {
    async fn handle(&self, client: &mut Client, spec: Document) {
        let _ = client.finish(doc! { "echoed": spec }, true).await;
    }
}

/// Scenario 5, throughput: 1000 jobs, two independent workers polling every
/// 10ms, a Hub sweeping every 100ms; every job completes at least once.
#[tokio::test]
async fn two_workers_drain_the_queue_between_them() {
    tokio::time::pause();

    let store = store();
    let hub = Arc::new(Hub::new(Arc::clone(&store), "test.gtest").unwrap());
    for i in 0..1000 {
        hub.insert_job(doc! { "i": i }, Some(1), None)
            .await
            .unwrap();
    }

    let sweep = Arc::clone(&hub).register(Duration::from_millis(100));
    let worker_a = Client::new(Arc::clone(&store), "test.gtest")
        .unwrap()
        .register(Duration::from_millis(10), Arc::new(ImmediateSuccess));
    let worker_b = Client::new(Arc::clone(&store), "test.gtest")
        .unwrap()
        .register(Duration::from_millis(10), Arc::new(ImmediateSuccess));

    for _ in 0..400 {
        advance_and_settle(Duration::from_millis(50)).await;
        if hub.count_ok().await.unwrap() == 1000 {
            break;
        }
    }

    assert_eq!(hub.count_ok().await.unwrap(), 1000);
    assert_eq!(hub.count_open().await.unwrap(), 0);
    assert_eq!(hub.count_assigned().await.unwrap(), 0);

    worker_a.request_stop();
    worker_b.request_stop();
    sweep.request_stop();
    worker_a.wait().await;
    worker_b.wait().await;
    sweep.wait().await;
}
