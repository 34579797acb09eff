//! The `Job` entity: one row per unit of orchestrated work,
//! covering all four roles in the hierarchy (MAIN, SPLIT, PAGE, MERGE).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Status;

/// The four roles in the job hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(
    feature = "database",
    sqlx(type_name = "text", rename_all = "lowercase")
)]
pub enum JobType {
    Main,
    Split,
    Page,
    Merge,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Main => "main",
            JobType::Split => "split",
            JobType::Page => "page",
            JobType::Merge => "merge",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input descriptor kind, set only on MAIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(
    feature = "database",
    sqlx(type_name = "text", rename_all = "lowercase")
)]
pub enum SourceType {
    File,
    Url,
    Gdrive,
    Dropbox,
    Audio,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Url => "url",
            SourceType::Gdrive => "gdrive",
            SourceType::Dropbox => "dropbox",
            SourceType::Audio => "audio",
        }
    }

    /// Only `file` sources carry a checksum at submission time, which
    /// is the precondition for the dedup gate.
    pub fn is_checksum_known_at_submission(&self) -> bool {
        matches!(self, SourceType::File)
    }
}

/// One row per unit of orchestrated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
pub struct Job {
    pub job_id: Uuid,
    pub user_id: String,
    pub job_type: JobType,
    pub parent_job_id: Option<Uuid>,

    // Input descriptor (MAIN only)
    pub source_type: Option<SourceType>,
    pub source_url: Option<String>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub file_checksum: Option<String>,

    // Blob pointers
    pub upload_object_key: Option<String>,
    pub result_object_key: Option<String>,

    // Progress
    pub status: Status,
    pub progress_percent: i32,
    pub error_message: Option<String>,

    // Pagination (MAIN only, populated by SPLIT)
    pub total_pages: Option<i32>,
    pub pages_completed: i32,
    pub pages_failed: i32,

    // Result metadata
    pub char_count: Option<i64>,
    pub has_result_stored: bool,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    // PAGE-job-only
    pub page_number: Option<i32>,
}

impl Job {
    /// Construct a new MAIN job at submission time.
    pub fn new_main(
        user_id: impl Into<String>,
        source_type: SourceType,
        source_url: Option<String>,
        filename: Option<String>,
        mime_type: Option<String>,
        file_size_bytes: Option<i64>,
        file_checksum: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: crate::clock::new_id(),
            user_id: user_id.into(),
            job_type: JobType::Main,
            parent_job_id: None,
            source_type: Some(source_type),
            source_url,
            filename,
            mime_type,
            file_size_bytes,
            file_checksum,
            upload_object_key: None,
            result_object_key: None,
            status: Status::Pending,
            progress_percent: 0,
            error_message: None,
            total_pages: None,
            pages_completed: 0,
            pages_failed: 0,
            char_count: None,
            has_result_stored: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            page_number: None,
        }
    }

    /// Construct a new child job (SPLIT, PAGE, or MERGE).
    pub fn new_child(
        job_type: JobType,
        parent: &Job,
        page_number: Option<i32>,
        now: DateTime<Utc>,
    ) -> Self {
        assert_ne!(job_type, JobType::Main, "new_child cannot create a MAIN job");
        assert_eq!(
            job_type == JobType::Page,
            page_number.is_some(),
            "PAGE jobs carry page_number, others do not"
        );

        Self {
            job_id: crate::clock::new_id(),
            user_id: parent.user_id.clone(),
            job_type,
            parent_job_id: Some(parent.job_id),
            source_type: None,
            source_url: None,
            filename: None,
            mime_type: None,
            file_size_bytes: None,
            file_checksum: None,
            upload_object_key: None,
            result_object_key: None,
            status: Status::Pending,
            progress_percent: 0,
            error_message: None,
            total_pages: None,
            pages_completed: 0,
            pages_failed: 0,
            char_count: None,
            has_result_stored: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            page_number,
        }
    }

    /// Cross-field consistency check, used by tests and defensively
    /// before persisting a patch.
    pub fn check_invariants(&self) -> Result<(), String> {
        if !(0..=100).contains(&self.progress_percent) {
            return Err(format!(
                "progress_percent {} out of [0,100]",
                self.progress_percent
            ));
        }
        if self.job_type == JobType::Page && self.page_number.is_none() {
            return Err("PAGE job missing page_number".to_string());
        }
        if self.job_type != JobType::Page && self.page_number.is_some() {
            return Err("non-PAGE job carries page_number".to_string());
        }
        if self.job_type != JobType::Main && self.parent_job_id.is_none() {
            return Err("non-MAIN job missing parent_job_id".to_string());
        }
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            if started > completed {
                return Err("started_at is after completed_at".to_string());
            }
        }
        if let Some(total) = self.total_pages {
            if self.pages_completed + self.pages_failed > total {
                return Err("pages_completed + pages_failed exceeds total_pages".to_string());
            }
        }
        Ok(())
    }

    pub fn is_dedup_eligible(&self) -> bool {
        self.job_type == JobType::Main
            && self
                .source_type
                .map(|s| s.is_checksum_known_at_submission())
                .unwrap_or(false)
            && self.file_checksum.is_some()
    }
}

/// A sparse set of field updates applied to a `Job` row via
/// `update_job(id, patch)`. `None` means "leave unchanged" for every
/// field except the two explicit `Option<Option<T>>` fields, which
/// distinguish "unset" from "clear to null".
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<Status>,
    pub progress_percent: Option<i32>,
    pub error_message: Option<Option<String>>,
    pub upload_object_key: Option<Option<String>>,
    pub result_object_key: Option<Option<String>>,
    pub total_pages: Option<i32>,
    pub pages_completed: Option<i32>,
    pub pages_failed: Option<i32>,
    pub char_count: Option<Option<i64>>,
    pub has_result_stored: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobPatch {
    pub fn new(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            ..Default::default()
        }
    }

    pub fn apply(self, job: &mut Job) {
        if let Some(v) = self.status {
            job.status = v;
        }
        if let Some(v) = self.progress_percent {
            job.progress_percent = v;
        }
        if let Some(v) = self.error_message {
            job.error_message = v;
        }
        if let Some(v) = self.upload_object_key {
            job.upload_object_key = v;
        }
        if let Some(v) = self.result_object_key {
            job.result_object_key = v;
        }
        if let Some(v) = self.total_pages {
            job.total_pages = Some(v);
        }
        if let Some(v) = self.pages_completed {
            job.pages_completed = v;
        }
        if let Some(v) = self.pages_failed {
            job.pages_failed = v;
        }
        if let Some(v) = self.char_count {
            job.char_count = v;
        }
        if let Some(v) = self.has_result_stored {
            job.has_result_stored = v;
        }
        if let Some(v) = self.started_at {
            job.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            job.completed_at = Some(v);
        }
        job.updated_at = self.updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_main(now: DateTime<Utc>) -> Job {
        Job::new_main(
            "user-1",
            SourceType::File,
            None,
            Some("note.pdf".to_string()),
            Some("application/pdf".to_string()),
            Some(1024),
            Some("0xAA".to_string()),
            now,
        )
    }

    #[test]
    fn new_main_satisfies_invariants() {
        let now = Utc::now();
        let job = sample_main(now);
        assert!(job.check_invariants().is_ok());
        assert!(job.parent_job_id.is_none());
        assert!(job.is_dedup_eligible());
    }

    #[test]
    fn new_child_page_requires_page_number() {
        let now = Utc::now();
        let main = sample_main(now);
        let page = Job::new_child(JobType::Page, &main, Some(1), now);
        assert_eq!(page.page_number, Some(1));
        assert_eq!(page.parent_job_id, Some(main.job_id));
        assert!(page.check_invariants().is_ok());
    }

    #[test]
    #[should_panic(expected = "PAGE jobs carry page_number")]
    fn new_child_page_without_number_panics() {
        let now = Utc::now();
        let main = sample_main(now);
        let _ = Job::new_child(JobType::Page, &main, None, now);
    }

    #[test]
    fn url_source_is_not_dedup_eligible() {
        let now = Utc::now();
        let mut job = sample_main(now);
        job.source_type = Some(SourceType::Url);
        job.file_checksum = None;
        assert!(!job.is_dedup_eligible());
    }

    #[test]
    fn progress_out_of_range_fails_invariant_check() {
        let now = Utc::now();
        let mut job = sample_main(now);
        job.progress_percent = 101;
        assert!(job.check_invariants().is_err());
    }

    #[test]
    fn pages_overflow_fails_invariant_check() {
        let now = Utc::now();
        let mut job = sample_main(now);
        job.total_pages = Some(3);
        job.pages_completed = 2;
        job.pages_failed = 2;
        assert!(job.check_invariants().is_err());
    }
}
