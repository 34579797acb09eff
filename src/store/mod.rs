//! Data store gateways. The orchestration core never
//! speaks either backing store's native vocabulary directly — every
//! other module goes through [`MetadataGateway`] or [`StatusCache`].

pub(crate) mod cache;
mod memory;
#[cfg(feature = "database")]
mod postgres;
mod redis_cache;

pub use cache::{ChildRole, StatusCache, StatusRecord};
pub use memory::{InMemoryMetadataStore, InMemoryStatusCache};
#[cfg(feature = "database")]
pub use postgres::PostgresMetadataStore;
pub use redis_cache::RedisStatusCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Job, JobPatch, JobType, Page, PagePatch, Status};

/// Which per-parent counter a page transition recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Completed,
    Failed,
}

impl CounterKind {
    fn counted_status(self) -> Status {
        match self {
            CounterKind::Completed => Status::Completed,
            CounterKind::Failed => Status::Failed,
        }
    }
}

/// Transactional gateway over the Job/Page tables.
#[async_trait]
pub trait MetadataGateway: Send + Sync {
    /// Idempotent on retry: a `job_id` that already exists returns the
    /// existing row without error.
    async fn create_job(&self, job: Job) -> Result<Job, StoreError>;

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError>;

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn find_children(
        &self,
        parent_id: Uuid,
        status_filter: Option<Status>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn delete_cascade(&self, main_id: Uuid) -> Result<(), StoreError>;

    /// Idempotent on retry: a `(job_id, page_number)` pair that already
    /// exists returns the existing row (the unique constraint from
    /// prevents duplicates across SPLIT retries).
    async fn create_page(&self, page: Page) -> Result<Page, StoreError>;

    async fn update_page(&self, page_id: Uuid, patch: PagePatch) -> Result<Page, StoreError>;

    async fn find_pages(&self, main_id: Uuid) -> Result<Vec<Page>, StoreError>;

    async fn find_page_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
    ) -> Result<Option<Page>, StoreError>;

    async fn find_page(&self, page_id: Uuid) -> Result<Option<Page>, StoreError>;

    /// Atomically flips the Page row keyed by `(job_id, page_number)`
    /// with `patch`, then recomputes the parent's `pages_completed` or
    /// `pages_failed` via `SELECT COUNT(*) ... WHERE job_id = ? AND
    /// status = ?` inside the *same* transaction. This is the
    /// race-free primitive that replaces scattered counter increments
    /// updated from multiple call sites.
    async fn transition_page(
        &self,
        main_id: Uuid,
        page_number: i32,
        patch: PagePatch,
        counted_as: CounterKind,
    ) -> Result<(Page, Job), StoreError>;

    /// Recompute a parent's counter without touching a page row
    /// (used by the cleanup/retry sweeps when counts may have drifted).
    async fn recount(&self, main_id: Uuid, counted_as: CounterKind) -> Result<Job, StoreError>;

    /// Dedup gate lookup: `(user_id, file_checksum)` for MAIN jobs.
    async fn find_dedup(
        &self,
        user_id: &str,
        file_checksum: &str,
    ) -> Result<Option<Job>, StoreError>;

    /// Jobs with `status = PROCESSING` and `started_at < older_than`.
    async fn list_stuck_jobs(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// Pages with `status = PROCESSING` and `created_at < older_than`
    /// (Pages lack `started_at`).
    async fn list_stuck_pages(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Page>, StoreError>;

    /// Pages with `status = FAILED` and `retry_count < max_retries`.
    async fn list_retryable_failed_pages(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<Page>, StoreError>;

    /// Retryable failed pages scoped to one parent.
    async fn list_retryable_failed_pages_for(
        &self,
        main_id: Uuid,
        max_retries: i32,
    ) -> Result<Vec<Page>, StoreError>;

    /// MAIN jobs in a terminal state with `completed_at < older_than`.
    async fn list_cleanup_candidates(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// Aggregate `(job_type, status) -> count` histogram.
    async fn status_histogram(&self) -> Result<Vec<(JobType, Status, i64)>, StoreError>;
}
