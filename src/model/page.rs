//! The `Page` entity: one row per logical page inside a
//! multi-page MAIN.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Status;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
pub struct Page {
    pub page_id: Uuid,
    pub job_id: Uuid,
    pub page_number: i32,
    pub page_job_id: Uuid,
    pub minio_page_path: String,
    pub status: Status,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub markdown_content: Option<String>,
    pub char_count: Option<i64>,
    pub has_result_stored: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Page {
    pub fn new(
        job_id: Uuid,
        page_number: i32,
        page_job_id: Uuid,
        minio_page_path: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            page_id: crate::clock::new_id(),
            job_id,
            page_number,
            page_job_id,
            minio_page_path: minio_page_path.into(),
            status: Status::Pending,
            error_message: None,
            retry_count: 0,
            markdown_content: None,
            char_count: None,
            has_result_stored: false,
            created_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    /// `retry_count <= maxRetries`.
    pub fn can_retry(&self, max_retries: i32) -> bool {
        self.retry_count < max_retries
    }
}

/// Sparse field update for a `Page` row.
#[derive(Debug, Clone, Default)]
pub struct PagePatch {
    pub page_job_id: Option<Uuid>,
    pub status: Option<Status>,
    pub error_message: Option<Option<String>>,
    pub retry_count: Option<i32>,
    pub markdown_content: Option<Option<String>>,
    pub char_count: Option<Option<i64>>,
    pub has_result_stored: Option<bool>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PagePatch {
    pub fn new(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            ..Default::default()
        }
    }

    pub fn apply(self, page: &mut Page) {
        if let Some(v) = self.page_job_id {
            page.page_job_id = v;
        }
        if let Some(v) = self.status {
            page.status = v;
        }
        if let Some(v) = self.error_message {
            page.error_message = v;
        }
        if let Some(v) = self.retry_count {
            page.retry_count = v;
        }
        if let Some(v) = self.markdown_content {
            page.markdown_content = v;
        }
        if let Some(v) = self.char_count {
            page.char_count = v;
        }
        if let Some(v) = self.has_result_stored {
            page.has_result_stored = v;
        }
        if let Some(v) = self.completed_at {
            page.completed_at = Some(v);
        }
        page.updated_at = self.updated_at;
    }
}
