//! Shared domain types for the job queue protocol: the job/log documents,
//! the lifecycle state enum, timestamp helpers, the error taxonomy, and the
//! `<db>.<queue>` prefix parser. Consumed by `jobq-store`, `jobq-hub`, and
//! `jobq-client` alike, the same way the teacher workspace splits its shared
//! types into a standalone core crate away from the engine/worker crates.

pub mod error;
pub mod model;
pub mod prefix;
pub mod state;
pub mod time;

pub use error::{Error, Result, StoreError};
pub use model::{owner_string, JobDocument, JobSummaryRow, LogRecord};
pub use prefix::Prefix;
pub use state::JobState;
