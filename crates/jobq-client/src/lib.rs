//! Client Worker: claims a job, hands its `spec` to a handler, batches log
//! records and binary payloads, checkpoints (heartbeat + log flush + the
//! client-side timeout trip), and terminates the job with a version-guarded
//! finish write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Document};
use jobq_core::model::owner_string;
use jobq_core::{time, Error, JobState, LogRecord, Prefix, Result};
use jobq_store::Store;

/// In-memory record of the job this `Client` currently holds. Exclusive to
/// one `Client` instance: nothing here is shared by reference across
/// processes or across other `Client`s in the same process (spec §3
/// "Ownership", §9 "In-memory claim as exclusive state").
struct ClaimedJob {
    id: ObjectId,
    deadline: Option<bson::DateTime>,
    version: i32,
    nr: u64,
    log_buffer: Vec<Document>,
}

/// The Client: claims jobs from a single `<prefix>` namespace, runs a
/// handler against each, and reports terminal results. Holds at most one
/// claim at a time (`ClaimedJob`); a second `claim_next` while one is held
/// is a protocol-misuse error (`Error::DoubleClaim`).
pub struct Client {
    store: Arc<dyn Store>,
    prefix: Prefix,
    selector: Document,
    claim: Option<ClaimedJob>,
}

impl Client {
    /// Wraps an already-connected store with no claim selector: any NEW
    /// job in the queue is eligible.
    pub fn new(store: Arc<dyn Store>, prefix: &str) -> Result<Self> {
        Self::with_selector(store, prefix, Document::new())
    }

    /// Wraps an already-connected store, restricting `claim_next` to NEW
    /// jobs additionally matching `selector` (spec §4.3, §6 "optional
    /// selector constrains which jobs this Client will claim").
    pub fn with_selector(store: Arc<dyn Store>, prefix: &str, selector: Document) -> Result<Self> {
        let prefix = Prefix::parse(prefix)?;
        Ok(Self {
            store,
            prefix,
            selector,
            claim: None,
        })
    }

    /// Whether this Client currently holds a claim.
    pub fn has_claim(&self) -> bool {
        self.claim.is_some()
    }

    /// The `_id` of the currently held claim, if any.
    pub fn claimed_id(&self) -> Option<ObjectId> {
        self.claim.as_ref().map(|c| c.id)
    }

    fn claim_mut(&mut self, op: &'static str) -> Result<&mut ClaimedJob> {
        self.claim.as_mut().ok_or(Error::NoClaim { op })
    }

    /// Atomically claims the next matching NEW job, flipping it to
    /// RUNNING. Fails with [`Error::DoubleClaim`] if a claim is already
    /// held. Returns `(spec, true)` on success or `(Document::new(), false)`
    /// if no NEW job matched.
    pub async fn claim_next(&mut self) -> Result<(Document, bool)> {
        if self.claim.is_some() {
            return Err(Error::DoubleClaim);
        }

        let now = time::now();
        let mut query = doc! { "state": JobState::New };
        for (k, v) in self.selector.clone() {
            query.insert(k, v);
        }

        let update = doc! {
            "$set": {
                "state": JobState::Running,
                "book_time": now,
                "refresh_time": now,
                "result.status": "running",
                "owner": owner_string(),
            },
        };

        let before = self
            .store
            .find_and_modify(&self.prefix.jobs_collection(), query, update)
            .await
            .map_err(Error::Store)?;

        let Some(before) = before else {
            return Ok((Document::new(), false));
        };

        let id = before
            .get_object_id("_id")
            .map_err(|e| Error::Parse(e.to_string()))?;
        let timeout = before.get_i32("timeout").ok().map(|t| t as u32);
        let spec = before
            .get_document("spec")
            .map_err(|e| Error::Parse(e.to_string()))?
            .clone();

        self.claim = Some(ClaimedJob {
            id,
            deadline: time::deadline(now, timeout),
            version: before.get_i32("version").unwrap_or(0),
            nr: 0,
            log_buffer: Vec::new(),
        });

        Ok((spec, true))
    }

    /// Appends an inline structured log record to the in-memory buffer for
    /// the currently claimed job. Not durable until the next `checkpoint`
    /// or `finish`. Requires a claim (`Error::NoClaim`).
    pub fn log(&mut self, level: i32, msg: Document) -> Result<()> {
        let job = self.claim_mut("log")?;
        let nr = job.nr;
        job.nr += 1;
        job.log_buffer.push(doc! {
            "taskid": job.id,
            "level": level,
            "nr": nr as i64,
            "timestamp": time::now(),
            "msg": msg,
        });
        Ok(())
    }

    /// Stores an opaque binary payload out of band (content-addressed by a
    /// freshly generated filename), merges `msg` into the resulting
    /// `.fs.files` document, and appends a log record referencing the
    /// filename. Requires a claim.
    pub async fn log_blob(&mut self, level: i32, bytes: &[u8], msg: Document) -> Result<()> {
        if self.claim.is_none() {
            return Err(Error::NoClaim { op: "log" });
        }

        let filename = uuid::Uuid::new_v4().to_string();
        let bucket = self.prefix.fs_bucket();
        let stored_name = self
            .store
            .store_blob(&bucket, bytes, &filename)
            .await
            .map_err(Error::Store)?;

        self.store
            .update(
                &format!("{bucket}.files"),
                doc! { "filename": stored_name.clone() },
                doc! { "$set": msg.clone() },
            )
            .await
            .map_err(Error::Store)?;

        let job = self.claim_mut("log")?;
        let nr = job.nr;
        job.nr += 1;
        job.log_buffer.push(doc! {
            "taskid": job.id,
            "level": level,
            "nr": nr as i64,
            "timestamp": time::now(),
            "msg": msg,
            "filename": stored_name,
        });
        Ok(())
    }

    /// Heartbeat + log flush, and (if `check_timeout`) the client-side
    /// deadline trip. Requires a claim.
    ///
    /// Open question (a) from the protocol design: the trip only fires
    /// *inside* this call, at or after the deadline: a handler that never
    /// checkpoints overruns its deadline with no preemption until
    /// supervision reschedules the job out from under it. There is no
    /// interrupt path; callers that need a hard deadline must checkpoint
    /// often enough to observe it.
    pub async fn checkpoint(&mut self, check_timeout: bool) -> Result<()> {
        if self.claim.is_none() {
            return Err(Error::NoClaim { op: "checkpoint" });
        }

        if check_timeout {
            let (id, tripped) = {
                let job = self.claim.as_ref().expect("checked above");
                let tripped = job
                    .deadline
                    .is_some_and(|d| time::now().timestamp_millis() >= d.timestamp_millis());
                (job.id, tripped)
            };

            if tripped {
                // Owner-guarded: if supervision already revived and another
                // worker reclaimed this job, `owner` no longer matches ours
                // and this write is a harmless no-op (spec §4.3, §9(a)).
                self.store
                    .update(
                        &self.prefix.jobs_collection(),
                        doc! { "_id": id, "owner": owner_string() },
                        doc! { "$set": { "state": JobState::Failed, "error": "timeout" } },
                    )
                    .await
                    .map_err(Error::Store)?;
                self.claim = None;
                return Err(Error::Timeout);
            }
        }

        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        let id = self.claim.as_ref().expect("claim checked by caller").id;

        self.store
            .update(
                &self.prefix.jobs_collection(),
                doc! { "_id": id },
                doc! { "$set": { "refresh_time": time::now() } },
            )
            .await
            .map_err(Error::Store)?;

        let records = std::mem::take(&mut self.claim.as_mut().expect("claim checked").log_buffer);
        for record in records {
            self.store
                .insert(&self.prefix.log_collection(), record)
                .await
                .map_err(Error::Store)?;
        }
        Ok(())
    }

    /// Flushes logs unconditionally (no timeout trip) and writes the
    /// terminal result, guarded by `version` so a finish racing a
    /// concurrent revival-and-reclaim can't silently clobber the newer
    /// claim's work (I5). Discards the in-memory claim either way.
    pub async fn finish(&mut self, result: Document, ok: bool) -> Result<()> {
        if self.claim.is_none() {
            return Err(Error::NoClaim { op: "finish" });
        }

        // Flush logs and heartbeat unconditionally, skipping the timeout
        // trip, per spec §4.3 ("First call checkpoint(false)").
        self.flush().await?;

        let job = self.claim.take().expect("checked above");
        let now = time::now();
        let update = if ok {
            doc! {
                "$set": {
                    "state": JobState::Ok,
                    "version": job.version + 1,
                    "finish_time": now,
                    "result": result,
                },
            }
        } else {
            doc! {
                "$set": {
                    "state": JobState::Failed,
                    "version": job.version + 1,
                    "failure_time": now,
                    "result.status": "fail",
                    "error": result,
                },
            }
        };

        self.store
            .update(
                &self.prefix.jobs_collection(),
                doc! { "_id": job.id, "version": job.version },
                update,
            )
            .await
            .map_err(Error::Store)?;
        Ok(())
    }

    /// Returns every log record written for `task_id`, sorted by `nr` (the
    /// order `log`/`log_blob` were called in). Works on any task, claimed
    /// or not, by the caller's own Client or another's, since `.log` is
    /// append-only and not owner-guarded.
    pub async fn get_log(&self, task_id: ObjectId) -> Result<Vec<LogRecord>> {
        let docs = self
            .store
            .query(
                &self.prefix.log_collection(),
                doc! { "taskid": task_id },
                Some(doc! { "nr": 1 }),
                None,
            )
            .await
            .map_err(Error::Store)?;
        docs.into_iter()
            .map(|d| bson::from_document(d).map_err(|e| Error::Parse(e.to_string())))
            .collect()
    }

    /// Convenience lookup with no protocol coupling: the best (lowest
    /// `result.loss`) successfully finished job matching `selector`.
    pub async fn best_finished(&self, selector: Document) -> Result<Option<Document>> {
        let mut query = doc! { "state": JobState::Ok };
        for (k, v) in selector {
            query.insert(k, v);
        }
        self.store
            .find_one(
                &self.prefix.jobs_collection(),
                query,
                Some(doc! { "result.loss": 1 }),
            )
            .await
            .map_err(Error::Store)
    }

    /// Spawns the periodic poll loop (spec §4.3/§5): on each jittered tick,
    /// attempt a claim, and if one succeeds, run `handler` against it
    /// synchronously before arming the next tick.
    pub fn register(self, interval: Duration, handler: Arc<dyn Handler>) -> ClientLoopHandle {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        let inner = Arc::new(LoopInner {
            stop_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
            event_tx,
        });
        let task_inner = Arc::clone(&inner);

        let join = tokio::spawn(async move {
            let mut client = self;
            let _ = task_inner.event_tx.send(ClientEvent::Started);
            loop {
                if task_inner.stop_requested.load(Ordering::SeqCst) {
                    break;
                }

                match client.claim_next().await {
                    Ok((spec, true)) => {
                        let id = client.claimed_id();
                        let _ = task_inner.event_tx.send(ClientEvent::Claimed { id });
                        handler.handle(&mut client, spec).await;
                        let _ = task_inner.event_tx.send(ClientEvent::Finished { id });
                    }
                    Ok((_, false)) => {}
                    Err(err) => {
                        let _ = task_inner.event_tx.send(ClientEvent::ClaimError {
                            message: err.to_string(),
                        });
                    }
                }

                let delay = time::jittered_interval(interval);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = task_inner.notify.notified() => {}
                }
            }
            let _ = task_inner.event_tx.send(ClientEvent::Stopped);
        });

        ClientLoopHandle { inner, join }
    }
}

/// User-supplied job handler, invoked with the claimed job's `spec` and a
/// handle back to the `Client` so it can `log`/`checkpoint`/`finish`.
///
/// Spec §4.3/§9 describes this as "a callable field on the Client, or
/// equivalently a capability interface". A trait object is the idiomatic
/// Rust rendering of the original's "override a virtual method" seam.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, client: &mut Client, spec: Document);
}

/// The default handler installed when none is overridden: immediately
/// fails the job with a warning, matching the original's default
/// `handle_task` body.
pub struct DefaultHandler;

#[async_trait]
impl Handler for DefaultHandler {
    async fn handle(&self, client: &mut Client, _spec: Document) {
        let _ = client
            .finish(
                doc! { "warning": "no handler registered for this task" },
                false,
            )
            .await;
    }
}

/// Poll-loop lifecycle events, broadcast to anyone subscribed (the same
/// ambient-signal idiom as `jobq_hub::HubEvent`).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Started,
    Claimed { id: Option<ObjectId> },
    Finished { id: Option<ObjectId> },
    ClaimError { message: String },
    Stopped,
}

struct LoopInner {
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
    event_tx: tokio::sync::broadcast::Sender<ClientEvent>,
}

/// Handle to a running poll loop, mirroring `jobq_hub::SweepHandle`.
pub struct ClientLoopHandle {
    inner: Arc<LoopInner>,
    join: tokio::task::JoinHandle<()>,
}

impl ClientLoopHandle {
    pub fn request_stop(&self) {
        if !self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClientEvent> {
        self.inner.event_tx.subscribe()
    }

    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_hub::Hub;
    use jobq_store::MemoryStore;

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn claim_next_flips_new_to_running_and_returns_spec() {
        let store = store();
        let hub = Hub::new(Arc::clone(&store), "test.gtest").unwrap();
        hub.insert_job(doc! { "foo": 1, "bar": 2 }, Some(1000), None)
            .await
            .unwrap();

        let mut client = Client::new(Arc::clone(&store), "test.gtest").unwrap();
        let (spec, claimed) = client.claim_next().await.unwrap();
        assert!(claimed);
        assert_eq!(spec.get_i32("foo").unwrap(), 1);
        assert_eq!(hub.count_assigned().await.unwrap(), 1);
        assert_eq!(hub.count_open().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn double_claim_is_rejected() {
        let store = store();
        let hub = Hub::new(Arc::clone(&store), "test.gtest").unwrap();
        hub.insert_job(doc! { "a": 1 }, None, None).await.unwrap();
        hub.insert_job(doc! { "a": 2 }, None, None).await.unwrap();

        let mut client = Client::new(store, "test.gtest").unwrap();
        client.claim_next().await.unwrap();
        let err = client.claim_next().await.unwrap_err();
        assert!(matches!(err, Error::DoubleClaim));
    }

    #[tokio::test]
    async fn claim_finish_round_trip_updates_counters() {
        let store = store();
        let hub = Hub::new(Arc::clone(&store), "test.gtest").unwrap();
        hub.insert_job(doc! { "foo": 1, "bar": 2 }, Some(1000), None)
            .await
            .unwrap();

        let mut client = Client::new(Arc::clone(&store), "test.gtest").unwrap();
        client.claim_next().await.unwrap();
        assert_eq!(hub.count_assigned().await.unwrap(), 1);
        assert_eq!(hub.count_open().await.unwrap(), 0);

        client.finish(doc! { "baz": 3 }, true).await.unwrap();
        assert_eq!(hub.count_ok().await.unwrap(), 1);
        assert_eq!(hub.count_open().await.unwrap(), 0);
        assert!(!client.has_claim());
    }

    #[tokio::test]
    async fn logging_round_trip_preserves_order() {
        let store = store();
        let hub = Hub::new(Arc::clone(&store), "test.gtest").unwrap();
        hub.insert_job(doc! { "foo": 1 }, Some(1000), None)
            .await
            .unwrap();

        let mut client = Client::new(Arc::clone(&store), "test.gtest").unwrap();
        client.claim_next().await.unwrap();
        let task_id = client.claimed_id().unwrap();

        client.log(0, doc! { "num": 1 }).unwrap();
        client.log(0, doc! { "num": 2 }).unwrap();
        client.checkpoint(true).await.unwrap();
        client.log(0, doc! { "num": 3 }).unwrap();
        client.checkpoint(true).await.unwrap();
        client.finish(doc! { "baz": 3 }, true).await.unwrap();

        let newest = hub.newest_finished().await.unwrap().unwrap();
        assert_eq!(newest.result.get_i32("baz").unwrap(), 3);

        let records = client.get_log(task_id).await.unwrap();
        assert_eq!(records.len(), 3);
        let nums: Vec<i32> = records
            .iter()
            .map(|r| r.msg.get_i32("num").unwrap())
            .collect();
        assert_eq!(nums, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn finish_is_ignored_when_version_is_stale() {
        let store = store();
        let hub = Hub::new(Arc::clone(&store), "test.gtest").unwrap();
        let id = hub
            .insert_job(doc! { "a": 1 }, Some(1000), None)
            .await
            .unwrap();

        let mut client = Client::new(Arc::clone(&store), "test.gtest").unwrap();
        client.claim_next().await.unwrap();

        // Simulate a concurrent revival-and-reclaim bumping the version
        // out from under this client's stale in-memory copy.
        store
            .update(
                "gtest.jobs",
                doc! { "_id": id },
                doc! { "$set": { "version": 99i32 } },
            )
            .await
            .unwrap();

        client.finish(doc! { "baz": 1 }, true).await.unwrap();
        assert_eq!(hub.count_ok().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn checkpoint_trips_timeout_and_marks_job_failed() {
        let store = store();
        let hub = Hub::new(Arc::clone(&store), "test.gtest").unwrap();
        hub.insert_job(doc! { "a": 1 }, Some(0), None).await.unwrap();

        let mut client = Client::new(Arc::clone(&store), "test.gtest").unwrap();
        client.claim_next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = client.checkpoint(true).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(!client.has_claim());
        assert_eq!(hub.count_failed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blob_logging_stores_file_and_references_it() {
        let store = store();
        let hub = Hub::new(Arc::clone(&store), "test.gtest").unwrap();
        hub.insert_job(doc! { "a": 1 }, Some(1000), None)
            .await
            .unwrap();

        let mut client = Client::new(Arc::clone(&store), "test.gtest").unwrap();
        client.claim_next().await.unwrap();
        client
            .log_blob(0, b"hallihallo".repeat(5).as_slice(), doc! { "baz": 3 })
            .await
            .unwrap();
        client.finish(doc! { "baz": 4 }, true).await.unwrap();

        let files = store
            .query("gtest.fs.files", doc! {}, None, None)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].contains_key("filename"));

        let records = store
            .query("gtest.log", doc! {}, None, None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].contains_key("filename"));
    }

    #[tokio::test]
    async fn default_handler_fails_job_with_warning() {
        let store = store();
        let hub = Hub::new(Arc::clone(&store), "test.gtest").unwrap();
        hub.insert_job(doc! { "a": 1 }, Some(1000), None)
            .await
            .unwrap();

        let mut client = Client::new(Arc::clone(&store), "test.gtest").unwrap();
        let (spec, claimed) = client.claim_next().await.unwrap();
        assert!(claimed);
        DefaultHandler.handle(&mut client, spec).await;
        assert_eq!(hub.count_failed().await.unwrap(), 1);
    }
}
