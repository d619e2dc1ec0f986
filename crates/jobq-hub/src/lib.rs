//! Hub Supervisor: job author and liveness watchdog. Inserts jobs, exposes
//! introspection counters, and runs the periodic sweep that revives a job
//! stuck in FAILED exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::doc;
use bson::oid::ObjectId;
use jobq_core::model::JobSummaryRow;
use jobq_core::{time, Error, JobDocument, JobState, Prefix, Result};
use jobq_store::Store;

/// Sweep lifecycle events, broadcast to anyone subscribed. The ambient
/// "what is this task doing" signal in place of a logging-crate dependency,
/// the same event-enum idiom the teacher's engine exposes as `EngineEvent`.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Started,
    /// One sweep pass ran; `revived` is the number of jobs moved FAILED -> NEW.
    Swept { revived: u64 },
    Stopped,
}

/// Handle to a running sweep task, mirroring the teacher engine's
/// stop-request/wait handle shape (`request_stop` flips an `AtomicBool` and
/// wakes a `Notify`; `wait` joins the spawned task).
pub struct SweepHandle {
    inner: Arc<SweepInner>,
    join: tokio::task::JoinHandle<()>,
}

struct SweepInner {
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
    event_tx: tokio::sync::broadcast::Sender<HubEvent>,
}

impl SweepHandle {
    /// Requests a graceful stop; the in-flight sweep (if any) finishes
    /// first.
    pub fn request_stop(&self) {
        if !self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Subscribes to sweep lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HubEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Waits for the sweep task to exit after a stop request.
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

/// The Hub: job author and supervisor over a single `<prefix>` namespace.
pub struct Hub {
    store: Arc<dyn Store>,
    prefix: Prefix,
}

impl Hub {
    /// Wraps an already-connected store. `jobq-store::MongoStore::connect`
    /// (or `MemoryStore::new` in tests) supplies `store`; `prefix` names the
    /// queue namespace within it.
    pub fn new(store: Arc<dyn Store>, prefix: &str) -> Result<Self> {
        let prefix = Prefix::parse(prefix)?;
        Ok(Self { store, prefix })
    }

    /// Creates one NEW job. `timeout_sec` of `None` means the job never
    /// trips a deadline. `driver_tag` is the optional `exp_key` routing/
    /// filtering string.
    pub async fn insert_job(
        &self,
        spec: bson::Document,
        timeout_sec: Option<u32>,
        driver_tag: Option<String>,
    ) -> Result<ObjectId> {
        let now = time::now();
        let mut doc = doc! {
            "state": JobState::New,
            "spec": spec,
            "result": { "status": "new" },
            "nfailed": 0i32,
            "version": 0i32,
            "create_time": now,
            "book_time": time::sentinel_max(),
            "refresh_time": time::sentinel_min(),
            "finish_time": time::sentinel_max(),
        };
        if let Some(t) = timeout_sec {
            doc.insert("timeout", t as i32);
        }
        if let Some(tag) = driver_tag {
            doc.insert("exp_key", tag);
        }
        let id = self
            .store
            .insert(&self.prefix.jobs_collection(), doc)
            .await
            .map_err(Error::Store)?;
        Ok(id)
    }

    async fn count_state(&self, state: JobState) -> Result<u64> {
        self.store
            .count(&self.prefix.jobs_collection(), doc! { "state": state })
            .await
            .map_err(Error::Store)
    }

    pub async fn count_open(&self) -> Result<u64> {
        self.count_state(JobState::New).await
    }

    pub async fn count_assigned(&self) -> Result<u64> {
        self.count_state(JobState::Running).await
    }

    pub async fn count_ok(&self) -> Result<u64> {
        self.count_state(JobState::Ok).await
    }

    pub async fn count_failed(&self) -> Result<u64> {
        self.count_state(JobState::Failed).await
    }

    /// The most recently finished successful job, or `None` if none have
    /// finished yet.
    pub async fn newest_finished(&self) -> Result<Option<JobDocument>> {
        let found = self
            .store
            .find_one(
                &self.prefix.jobs_collection(),
                doc! { "state": JobState::Ok },
                Some(doc! { "finish_time": -1 }),
            )
            .await
            .map_err(Error::Store)?;
        found
            .map(|d| bson::from_document(d).map_err(|e| Error::Parse(e.to_string())))
            .transpose()
    }

    /// Drops every collection under this prefix: jobs, log, and both GridFS
    /// collections. Used by test tooling to reset a queue namespace between
    /// runs.
    pub async fn clear_all(&self) -> Result<()> {
        let fs = self.prefix.fs_bucket();
        for coll in [
            self.prefix.jobs_collection(),
            self.prefix.log_collection(),
            format!("{fs}.files"),
            format!("{fs}.chunks"),
        ] {
            self.store.drop(&coll).await.map_err(Error::Store)?;
        }
        Ok(())
    }

    /// Per-job diagnostic rows: the typed equivalent of the original's
    /// job-summary table. Not part of the wire protocol; purely for a
    /// caller to render or log as it sees fit.
    pub async fn job_summary(&self) -> Result<Vec<JobSummaryRow>> {
        let docs = self
            .store
            .query(&self.prefix.jobs_collection(), doc! {}, None, None)
            .await
            .map_err(Error::Store)?;
        docs.into_iter()
            .map(|d| {
                let job: JobDocument =
                    bson::from_document(d).map_err(|e| Error::Parse(e.to_string()))?;
                let deadline = time::deadline(job.book_time, job.timeout);
                Ok(JobSummaryRow {
                    id: job.id,
                    state: job.state,
                    nfailed: job.nfailed,
                    owner: job.owner,
                    create_time: job.create_time,
                    book_time: job.book_time,
                    finish_time: job.finish_time,
                    deadline,
                    spec: job.spec,
                })
            })
            .collect()
    }

    async fn sweep_once(&self) -> Result<u64> {
        self.store
            .update(
                &self.prefix.jobs_collection(),
                doc! { "state": JobState::Failed, "nfailed": { "$lt": 1i32 } },
                doc! {
                    "$inc": { "nfailed": 1i32 },
                    "$set": {
                        "state": JobState::New,
                        "book_time": time::sentinel_max(),
                        "refresh_time": time::sentinel_min(),
                    },
                },
            )
            .await
            .map_err(Error::Store)
    }

    /// Spawns the periodic sweep: every `interval` (jittered per the
    /// protocol's poll decorrelation rule), revive every job stuck at
    /// `{state: FAILED, nfailed < 1}` back to NEW, incrementing `nfailed`.
    /// A second visit to FAILED is terminal: `nfailed` no longer matches
    /// `< 1`.
    pub fn register(self: Arc<Self>, interval: Duration) -> SweepHandle {
        let hub = self;
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        let inner = Arc::new(SweepInner {
            stop_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
            event_tx,
        });
        let task_inner = Arc::clone(&inner);

        let join = tokio::spawn(async move {
            let _ = task_inner.event_tx.send(HubEvent::Started);
            loop {
                if task_inner.stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                if let Ok(revived) = hub.sweep_once().await {
                    let _ = task_inner.event_tx.send(HubEvent::Swept { revived });
                }

                let delay = time::jittered_interval(interval);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = task_inner.notify.notified() => {}
                }
            }
            let _ = task_inner.event_tx.send(HubEvent::Stopped);
        });

        SweepHandle { inner, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_store::MemoryStore;

    fn hub() -> Hub {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Hub::new(store, "test.gtest").unwrap()
    }

    #[tokio::test]
    async fn create_destroy_scenario() {
        let hub = hub();
        assert_eq!(hub.count_open().await.unwrap(), 0);

        hub.insert_job(doc! { "foo": 1, "bar": 2 }, Some(1000), None)
            .await
            .unwrap();

        assert_eq!(hub.count_open().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sweep_revives_failed_job_exactly_once() {
        let hub = hub();
        let id = hub
            .insert_job(doc! { "foo": 1 }, Some(1), None)
            .await
            .unwrap();

        // Drive a job directly to FAILED the way a Client's timeout trip
        // would, then sweep it.
        let jobs = hub.prefix.jobs_collection();
        hub.store
            .update(
                &jobs,
                doc! { "_id": id },
                doc! { "$set": { "state": JobState::Failed } },
            )
            .await
            .unwrap();

        let revived = hub.sweep_once().await.unwrap();
        assert_eq!(revived, 1);
        assert_eq!(hub.count_open().await.unwrap(), 1);
        assert_eq!(hub.count_failed().await.unwrap(), 0);

        // Fail it a second time: nfailed is now 1, so the sweep predicate
        // `nfailed < 1` no longer matches and it stays terminal.
        hub.store
            .update(
                &jobs,
                doc! { "_id": id },
                doc! { "$set": { "state": JobState::Failed } },
            )
            .await
            .unwrap();
        let revived_again = hub.sweep_once().await.unwrap();
        assert_eq!(revived_again, 0);
        assert_eq!(hub.count_failed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn counter_identity_matches_total_inserted() {
        let hub = hub();
        for i in 0..5 {
            hub.insert_job(doc! { "i": i }, None, None).await.unwrap();
        }
        let total = hub.count_open().await.unwrap()
            + hub.count_assigned().await.unwrap()
            + hub.count_ok().await.unwrap()
            + hub.count_failed().await.unwrap();
        assert_eq!(total, 5);
    }
}
