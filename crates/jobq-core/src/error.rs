use thiserror::Error;

/// Failures reported by a [`crate::Store`](../jobq_store) implementation.
///
/// The adapter never retries; every variant here is surfaced to the caller
/// on the operation that produced it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connect(String),

    #[error("store operation failed: {0}")]
    Operation(String),

    #[error("malformed document returned by store: {0}")]
    MalformedDocument(String),
}

/// Errors surfaced by the job queue protocol (Hub or Client).
///
/// Matches the taxonomy in the protocol's error handling design: protocol
/// misuse, the client-side timeout trip, store errors, and prefix parsing.
#[derive(Debug, Error)]
pub enum Error {
    /// `claim_next` called while a claim is already held.
    #[error("double claim: a job is already claimed; finish it before claiming another")]
    DoubleClaim,

    /// `log`, `checkpoint`, or `finish` called with no claim held.
    #[error("no claim held: cannot call `{op}` before a successful claim_next")]
    NoClaim { op: &'static str },

    /// The client-side deadline trip fired inside `checkpoint`. The job has
    /// already been written to FAILED (guarded by `owner`) before this is
    /// raised.
    #[error("job timed out")]
    Timeout,

    /// A store-layer failure on the most recently attempted operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An invalid `<prefix>` (must contain at least one `.`) or a
    /// malformed document received back from the store.
    #[error("invalid prefix or malformed document: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
