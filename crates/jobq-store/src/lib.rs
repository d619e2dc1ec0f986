//! The Job Store Adapter: a small, storage-engine-agnostic trait the Hub and
//! Client build on, plus a MongoDB-backed implementation and an in-memory
//! fake used by the test suites in `jobq-hub`/`jobq-client`.

mod memory;
mod mongo;

use async_trait::async_trait;
use bson::Document;
use jobq_core::StoreError;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// The seven primitives every caller needs from the underlying store. No
/// retries happen at this layer: every failure surfaces to the caller on
/// the operation that produced it.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts `doc` into `collection`, returning its generated `_id`.
    async fn insert(&self, collection: &str, doc: Document) -> Result<bson::oid::ObjectId>;

    /// Atomically matches `query` against `collection` and applies `update`,
    /// returning the document as it looked *before* the update (the
    /// `findAndModify` "return pre-image" behavior), or `None` if nothing
    /// matched.
    async fn find_and_modify(
        &self,
        collection: &str,
        query: Document,
        update: Document,
    ) -> Result<Option<Document>>;

    /// Applies `update` to every document in `collection` matching `query`,
    /// returning the number of documents matched.
    async fn update(&self, collection: &str, query: Document, update: Document) -> Result<u64>;

    /// Returns the first document in `collection` matching `query`, ordered
    /// by `sort` if given.
    async fn find_one(
        &self,
        collection: &str,
        query: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>>;

    /// Returns every document in `collection` matching `query`, ordered by
    /// `sort` if given and capped at `limit` if given.
    async fn query(
        &self,
        collection: &str,
        query: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> Result<Vec<Document>>;

    /// Counts documents in `collection` matching `query`.
    async fn count(&self, collection: &str, query: Document) -> Result<u64>;

    /// Drops `collection` entirely. Used by test/reset tooling
    /// (`Hub::clear_all`).
    async fn drop(&self, collection: &str) -> Result<()>;

    /// Stores an opaque blob under `bucket` (a GridFS bucket name for
    /// [`MongoStore`], giving collections `<bucket>.files`/`<bucket>.chunks`.
    /// Callers pass `Prefix::fs_bucket()` so each queue's blobs land in
    /// that queue's own collections, the same namespace `Hub::clear_all`
    /// drops). Returns an identifier a caller can later use to retrieve it.
    async fn store_blob(&self, bucket: &str, bytes: &[u8], filename: &str) -> Result<String>;
}
