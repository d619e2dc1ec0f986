use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::state::JobState;

/// A job document as stored in `<prefix>.jobs`. Mirrors the field table and
/// invariants in the protocol data model section exactly. `spec` and
/// `result` stay as raw [`Document`]s since they carry opaque,
/// caller-defined payloads. `error` is looser still: the client-side
/// timeout trip writes it as a plain string (`"timeout"`), while a failed
/// `finish` writes it as the caller's error document, so it has to be the
/// untyped [`Bson`] both shapes have in common.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub state: i32,
    pub spec: Document,
    #[serde(default)]
    pub result: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Bson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_key: Option<String>,
    pub create_time: bson::DateTime,
    pub book_time: bson::DateTime,
    pub refresh_time: bson::DateTime,
    pub finish_time: bson::DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub nfailed: i32,
    pub version: i32,
}

impl JobDocument {
    pub fn state(&self) -> Option<JobState> {
        JobState::from_i32(self.state)
    }
}

/// One append-only log record in `<prefix>.log`, keyed by `taskid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub taskid: ObjectId,
    pub level: i32,
    pub nr: u64,
    pub timestamp: bson::DateTime,
    pub msg: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A diagnostic row produced by [`crate`]-consuming Hub summaries: the
/// typed, non-printing equivalent of the original's job-summary table
/// (state, nfailed, owner, the three lifecycle timestamps, the computed
/// deadline, and the opaque spec).
#[derive(Debug, Clone, Serialize)]
pub struct JobSummaryRow {
    pub id: ObjectId,
    pub state: i32,
    pub nfailed: i32,
    pub owner: Option<String>,
    pub create_time: bson::DateTime,
    pub book_time: bson::DateTime,
    pub finish_time: bson::DateTime,
    pub deadline: Option<bson::DateTime>,
    pub spec: Document,
}

/// Owner string `"<host>:<pid>"` written into a job at claim, and compared
/// on every owner-guarded punitive or terminal write.
pub fn owner_string() -> String {
    let host = hostname();
    format!("{host}:{}", std::process::id())
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
