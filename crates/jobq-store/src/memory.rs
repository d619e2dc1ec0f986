use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use tokio::sync::Mutex;

use crate::{Result, Store};

/// An in-process [`Store`] used by the `jobq-hub`/`jobq-client` test suites
/// so the protocol's atomicity and lifecycle properties are testable
/// without a live `mongod`. One [`Mutex`] covers the whole store: every
/// operation (not just `find_and_modify`) takes it, which is exactly the
/// single-claimer guarantee the real server's `findAndModify` gives for
/// free and that this fake has to earn by brute force.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn bson_cmp(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(x.cmp(y)),
        (Bson::Int64(x), Bson::Int64(y)) => Some(x.cmp(y)),
        (Bson::Int32(x), Bson::Int64(y)) => Some((*x as i64).cmp(y)),
        (Bson::Int64(x), Bson::Int32(y)) => Some(x.cmp(&(*y as i64))),
        (Bson::Double(x), Bson::Double(y)) => x.partial_cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Reads a possibly dotted field path (`"result.status"`) out of `doc`,
/// the same path syntax MongoDB uses in queries, sorts, and `$set` keys.
fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => doc.get(path),
        Some((head, rest)) => doc.get(head).and_then(Bson::as_document).and_then(|sub| get_path(sub, rest)),
    }
}

/// Writes `value` at a possibly dotted field path, creating intermediate
/// sub-documents as needed (the `$set`-side counterpart of [`get_path`]).
fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Bson::Document(Document::new()));
            }
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                set_path(sub, rest, value);
            }
        }
    }
}

/// Matches a query fragment against `doc`. Supports plain (dotted-path)
/// field equality plus the handful of operators the Hub sweep and claim
/// queries actually need: `$lt`, `$lte`, `$gt`, `$gte`, `$ne`, `$exists`,
/// and `$or`.
fn matches(doc: &Document, query: &Document) -> bool {
    query.iter().all(|(key, expected)| {
        if key == "$or" {
            let Some(clauses) = expected.as_array() else {
                return false;
            };
            return clauses.iter().any(|c| {
                c.as_document()
                    .map(|sub| matches(doc, sub))
                    .unwrap_or(false)
            });
        }

        let actual = get_path(doc, key);
        match expected {
            Bson::Document(ops) if ops.keys().all(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, val)| match op.as_str() {
                    "$exists" => {
                        let want = val.as_bool().unwrap_or(true);
                        actual.is_some() == want
                    }
                    "$ne" => actual != Some(val),
                    "$lt" => actual
                        .and_then(|a| bson_cmp(a, val))
                        .is_some_and(|o| o == Ordering::Less),
                    "$lte" => actual
                        .and_then(|a| bson_cmp(a, val))
                        .is_some_and(|o| o != Ordering::Greater),
                    "$gt" => actual
                        .and_then(|a| bson_cmp(a, val))
                        .is_some_and(|o| o == Ordering::Greater),
                    "$gte" => actual
                        .and_then(|a| bson_cmp(a, val))
                        .is_some_and(|o| o != Ordering::Less),
                    _ => false,
                })
            }
            _ => actual == Some(expected),
        }
    })
}

fn as_i64(b: &Bson) -> Option<i64> {
    match b {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

/// Applies an update fragment (`$set`/`$inc`/`$unset`, or a plain
/// replacement document) to `doc` in place.
fn apply_update(doc: &mut Document, update: &Document) {
    let has_operators = update.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        let id = doc.get("_id").cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert("_id", id);
        }
        return;
    }

    if let Some(Bson::Document(set)) = update.get("$set") {
        for (k, v) in set {
            set_path(doc, k, v.clone());
        }
    }
    if let Some(Bson::Document(inc)) = update.get("$inc") {
        for (k, v) in inc {
            let delta = as_i64(v).unwrap_or(0);
            let current = get_path(doc, k).and_then(as_i64).unwrap_or(0);
            set_path(doc, k, Bson::Int32((current + delta) as i32));
        }
    }
    if let Some(Bson::Document(unset)) = update.get("$unset") {
        for k in unset.keys() {
            doc.remove(k);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, collection: &str, mut doc: Document) -> Result<ObjectId> {
        let id = ObjectId::new();
        doc.insert("_id", id);
        let mut colls = self.collections.lock().await;
        colls.entry(collection.to_string()).or_default().push(doc);
        Ok(id)
    }

    async fn find_and_modify(
        &self,
        collection: &str,
        query: Document,
        update: Document,
    ) -> Result<Option<Document>> {
        let mut colls = self.collections.lock().await;
        let docs = colls.entry(collection.to_string()).or_default();
        let Some(slot) = docs.iter_mut().find(|d| matches(d, &query)) else {
            return Ok(None);
        };
        let before = slot.clone();
        apply_update(slot, &update);
        Ok(Some(before))
    }

    async fn update(&self, collection: &str, query: Document, update: Document) -> Result<u64> {
        let mut colls = self.collections.lock().await;
        let docs = colls.entry(collection.to_string()).or_default();
        let mut matched = 0u64;
        for doc in docs.iter_mut().filter(|d| matches(d, &query)) {
            apply_update(doc, &update);
            matched += 1;
        }
        Ok(matched)
    }

    async fn find_one(
        &self,
        collection: &str,
        query: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>> {
        let mut results = self.query(collection, query, sort, Some(1)).await?;
        Ok(if results.is_empty() {
            None
        } else {
            Some(results.remove(0))
        })
    }

    async fn query(
        &self,
        collection: &str,
        query: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> Result<Vec<Document>> {
        let colls = self.collections.lock().await;
        let mut results: Vec<Document> = colls
            .get(collection)
            .map(|docs| docs.iter().filter(|d| matches(d, &query)).cloned().collect())
            .unwrap_or_default();

        if let Some(sort) = sort {
            if let Some((key, dir)) = sort.iter().next() {
                let dir = dir.as_i32().unwrap_or(1);
                results.sort_by(|a, b| {
                    let ord = get_path(a, key)
                        .zip(get_path(b, key))
                        .and_then(|(x, y)| bson_cmp(x, y))
                        .unwrap_or(Ordering::Equal);
                    if dir < 0 {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
        }

        if let Some(limit) = limit {
            results.truncate(limit.max(0) as usize);
        }

        Ok(results)
    }

    async fn count(&self, collection: &str, query: Document) -> Result<u64> {
        Ok(self.query(collection, query, None, None).await?.len() as u64)
    }

    async fn drop(&self, collection: &str) -> Result<()> {
        self.collections.lock().await.remove(collection);
        Ok(())
    }

    async fn store_blob(&self, bucket: &str, bytes: &[u8], filename: &str) -> Result<String> {
        let name = format!("{}-{}", uuid::Uuid::new_v4(), filename);
        let mut colls = self.collections.lock().await;
        let mut doc = Document::new();
        doc.insert("filename", name.clone());
        doc.insert("length", bytes.len() as i64);
        colls
            .entry(format!("{bucket}.files"))
            .or_default()
            .push(doc);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn insert_then_find_one_round_trips() {
        let store = MemoryStore::new();
        let id = store
            .insert("jobs", doc! { "state": 0 })
            .await
            .unwrap();
        let found = store
            .find_one("jobs", doc! { "_id": id }, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get_i32("state").unwrap(), 0);
    }

    #[tokio::test]
    async fn find_and_modify_is_atomic_per_document() {
        let store = MemoryStore::new();
        store.insert("jobs", doc! { "state": 0 }).await.unwrap();

        let claimed = store
            .find_and_modify(
                "jobs",
                doc! { "state": 0 },
                doc! { "$set": { "state": 1 } },
            )
            .await
            .unwrap();
        assert!(claimed.is_some());

        let second = store
            .find_and_modify(
                "jobs",
                doc! { "state": 0 },
                doc! { "$set": { "state": 1 } },
            )
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn range_query_operators() {
        let store = MemoryStore::new();
        store.insert("jobs", doc! { "nfailed": 0 }).await.unwrap();
        store.insert("jobs", doc! { "nfailed": 3 }).await.unwrap();

        let few_failures = store
            .query("jobs", doc! { "nfailed": { "$lt": 1 } }, None, None)
            .await
            .unwrap();
        assert_eq!(few_failures.len(), 1);
    }
}
