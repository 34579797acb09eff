//! Error taxonomy for the orchestration core.
//!
//! Leaf stores/collaborators raise their own `thiserror` enums
//! (`StoreError`, `QueueError`, `BlobStoreError`, ...); task handlers
//! and the monitor loop classify those into [`TaskError`], whose
//! variants map directly onto a fail-close vs fail-open propagation
//! policy per category.

use uuid::Uuid;

/// Error raised by the metadata store gateway.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("page not found: job={job_id} page={page_number}")]
    PageNotFound { job_id: Uuid, page_number: i32 },

    #[error("constraint violation: {0}")]
    Constraint(String),
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Error raised by the status cache gateway.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Error raised by the queue client.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(String),

    #[error("unknown task name: {0}")]
    UnknownTask(String),
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// Error raised by the blob store.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob reference: {0}")]
    InvalidRef(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Error raised by the result index.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("index backend error: {0}")]
    Backend(String),

    #[error("entry not found: {0}")]
    NotFound(String),
}

/// Error raised by the document/audio/page collaborators.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("split failed: {0}")]
    SplitFailed(String),

    #[error("source fetch failed: {0}")]
    FetchFailed(String),

    #[error("soft time limit exceeded ({0}s)")]
    SoftTimeout(u64),
}

/// The classification a task handler uses to decide retry policy.
///
/// Every failure a task handler can observe is mapped to exactly one
/// of these before it is persisted, rather than caught-and-swallowed
/// at the call site.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Bad input caught before any job row was created; never retried
    /// because no job exists to retry.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A transient failure in an external dependency: retried with
    /// exponential backoff up to the handler's cap.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The task's soft time limit fired; consumes a retry attempt like
    /// `Transient` but is reported with a distinct message.
    #[error("exceeded soft time limit ({0}s)")]
    SoftTimeout(u64),

    /// A failure that must never be retried (e.g. merge failure
    /// propagating to the parent).
    #[error("terminal failure: {0}")]
    Terminal(String),
}

impl TaskError {
    /// Human-readable message to persist on the job/page row's
    /// `error_message` field.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Whether this error counts against a handler's retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_) | TaskError::SoftTimeout(_))
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        TaskError::Transient(e.to_string())
    }
}

impl From<CacheError> for TaskError {
    fn from(e: CacheError) -> Self {
        TaskError::Transient(e.to_string())
    }
}

impl From<QueueError> for TaskError {
    fn from(e: QueueError) -> Self {
        TaskError::Transient(e.to_string())
    }
}

impl From<BlobStoreError> for TaskError {
    fn from(e: BlobStoreError) -> Self {
        TaskError::Transient(e.to_string())
    }
}

impl From<CollaboratorError> for TaskError {
    fn from(e: CollaboratorError) -> Self {
        match e {
            CollaboratorError::SoftTimeout(secs) => TaskError::SoftTimeout(secs),
            other => TaskError::Transient(other.to_string()),
        }
    }
}
