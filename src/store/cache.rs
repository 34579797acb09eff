//! Status cache gateway: the fast key/value projection
//! used for progress polling and the aggregator's fan-in check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CacheError;
use crate::model::{JobType, Status};

/// `children:{main_id}:{role}` role discriminator (spec's persisted
/// state layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRole {
    Split,
    Page,
    Merge,
}

impl ChildRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildRole::Split => "split",
            ChildRole::Page => "page",
            ChildRole::Merge => "merge",
        }
    }
}

/// The `status:{job_id}` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: Status,
    pub progress: i32,
    pub name: Option<String>,
    pub page_number: Option<i32>,
    pub parent_job_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// The fast key/value projection of job state.
///
/// Every method must be idempotent on retry: a put-status with the
/// same fields is a no-op, matching the queue's at-least-once
/// delivery contract.
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn put_status(&self, job_id: Uuid, record: StatusRecord) -> Result<(), CacheError>;
    async fn get_status(&self, job_id: Uuid) -> Result<Option<StatusRecord>, CacheError>;

    async fn set_owner(&self, job_id: Uuid, user_id: &str) -> Result<(), CacheError>;
    async fn verify_owner(&self, job_id: Uuid, user_id: &str) -> Result<bool, CacheError>;
    async fn list_user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<Uuid>, CacheError>;

    async fn update_progress(&self, job_id: Uuid, value: i32) -> Result<(), CacheError>;

    async fn add_child(
        &self,
        parent_id: Uuid,
        role: ChildRole,
        child_id: Uuid,
    ) -> Result<(), CacheError>;
    async fn get_page_children(&self, parent_id: Uuid) -> Result<Vec<Uuid>, CacheError>;
    async fn get_child(
        &self,
        parent_id: Uuid,
        role: ChildRole,
    ) -> Result<Option<Uuid>, CacheError>;

    /// Register `child_id` as the parent's `role` child iff no such
    /// slot is occupied yet, atomically. Returns `true` if this call
    /// won the race and registered the id, `false` if another caller
    /// had already won.
    async fn set_child_if_absent(
        &self,
        parent_id: Uuid,
        role: ChildRole,
        child_id: Uuid,
    ) -> Result<bool, CacheError>;

    async fn set_pages_total(&self, main_id: Uuid, n: i32) -> Result<(), CacheError>;
    async fn get_pages_total(&self, main_id: Uuid) -> Result<Option<i32>, CacheError>;

    async fn set_page_child_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
        page_job_id: Uuid,
    ) -> Result<(), CacheError>;
    async fn get_page_child_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
    ) -> Result<Option<Uuid>, CacheError>;

    async fn count_completed_page_children(&self, main_id: Uuid) -> Result<usize, CacheError>;
    async fn count_failed_page_children(&self, main_id: Uuid) -> Result<usize, CacheError>;

    /// True iff every registered page child's status record is in
    /// `{COMPLETED, FAILED, CANCELLED}`.
    async fn all_page_children_terminal(&self, main_id: Uuid) -> Result<bool, CacheError>;

    async fn set_result(&self, job_id: Uuid, blob: serde_json::Value) -> Result<(), CacheError>;
    async fn get_result(&self, job_id: Uuid) -> Result<Option<serde_json::Value>, CacheError>;

    /// Delete every key family scoped to `main_id` (cleanup
    /// sweep): status, result, pages-total, child lists, per-page keys.
    async fn purge(&self, main_id: Uuid) -> Result<(), CacheError>;
}
