//! Splitter task (SPLIT task handler): decompose a PDF into
//! N page artifacts, create Page rows, enqueue PAGE x N.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::PipelineCore;
use crate::error::TaskError;
use crate::model::{JobPatch, JobType, Page, Status};
use crate::options::SubmissionOptions;
use crate::queue::TaskHandler;
use crate::store::cache::StatusRecord;
use crate::store::ChildRole;

pub const MAX_ATTEMPTS: i32 = 2;
const RETRY_BASE_SECONDS: u64 = 30;

pub fn retry_delay_seconds(attempt: u32) -> u64 {
    RETRY_BASE_SECONDS * 2u64.saturating_pow(attempt)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitTaskArgs {
    pub split_id: Uuid,
    pub parent_id: Uuid,
    pub local_path: String,
    pub options: SubmissionOptions,
}

pub struct SplitTaskHandler {
    core: Arc<PipelineCore>,
}

impl SplitTaskHandler {
    pub fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }

    async fn run(&self, args: SplitTaskArgs) -> Result<(), TaskError> {
        let now = Utc::now();
        let split_id = args.split_id;
        let parent_id = args.parent_id;

        let mut patch = JobPatch::new(now);
        patch.status = Some(Status::Processing);
        patch.started_at = Some(now);
        self.core.metadata.update_job(split_id, patch).await?;
        self.core
            .cache
            .put_status(
                split_id,
                StatusRecord {
                    job_type: JobType::Split,
                    status: Status::Processing,
                    progress: 0,
                    name: None,
                    page_number: None,
                    parent_job_id: Some(parent_id),
                    started_at: Some(now),
                    completed_at: None,
                    error: None,
                },
            )
            .await?;

        let local_path = std::path::PathBuf::from(&args.local_path);
        let mut pages = self
            .core
            .page_extractor
            .split(&local_path, parent_id)
            .await
            .map_err(TaskError::from)?;
        pages.sort_by_key(|p| p.page_number);
        let total = pages.len() as i32;

        let mut main_patch = JobPatch::new(Utc::now());
        main_patch.total_pages = Some(total);
        self.core.metadata.update_job(parent_id, main_patch).await?;
        self.core.cache.set_pages_total(parent_id, total).await?;

        for extracted in &pages {
            let bytes = tokio::fs::read(&extracted.local_path)
                .await
                .map_err(|e| TaskError::Transient(format!("reading extracted page: {e}")))?;
            self.core
                .blobs
                .store(&extracted.blob_key, &bytes)
                .await
                .map_err(|e| TaskError::Transient(e.to_string()))?;

            let page_job_id = crate::clock::new_id();
            let page = Page::new(
                parent_id,
                extracted.page_number,
                page_job_id,
                extracted.blob_key.clone(),
                Utc::now(),
            );
            self.core.metadata.create_page(page).await?;

            self.core
                .cache
                .put_status(
                    page_job_id,
                    StatusRecord {
                        job_type: JobType::Page,
                        status: Status::Queued,
                        progress: 0,
                        name: None,
                        page_number: Some(extracted.page_number),
                        parent_job_id: Some(parent_id),
                        started_at: None,
                        completed_at: None,
                        error: None,
                    },
                )
                .await?;
            self.core.cache.add_child(parent_id, ChildRole::Page, page_job_id).await?;
            self.core
                .cache
                .set_page_child_by_number(parent_id, extracted.page_number, page_job_id)
                .await?;

            let page_args = crate::page_task::PageTaskArgs {
                page_job_id,
                parent_id,
                page_number: extracted.page_number,
                page_file_path: extracted.local_path.display().to_string(),
                options: args.options.clone(),
            };
            self.core
                .queue
                .enqueue(
                    "page",
                    serde_json::to_value(page_args).expect("PageTaskArgs always serializes"),
                    crate::page_task::MAX_ATTEMPTS,
                )
                .await
                .map_err(|e| TaskError::Transient(e.to_string()))?;
        }

        let completed_at = Utc::now();
        let mut split_patch = JobPatch::new(completed_at);
        split_patch.status = Some(Status::Completed);
        split_patch.progress_percent = Some(100);
        split_patch.completed_at = Some(completed_at);
        self.core.metadata.update_job(split_id, split_patch).await?;
        self.core
            .cache
            .put_status(
                split_id,
                StatusRecord {
                    job_type: JobType::Split,
                    status: Status::Completed,
                    progress: 100,
                    name: None,
                    page_number: None,
                    parent_job_id: Some(parent_id),
                    started_at: Some(now),
                    completed_at: Some(completed_at),
                    error: None,
                },
            )
            .await?;

        Ok(())
    }

    async fn fail_split(&self, split_id: Uuid, message: String) {
        let now = Utc::now();
        let mut patch = JobPatch::new(now);
        patch.status = Some(Status::Failed);
        patch.error_message = Some(Some(message));
        patch.completed_at = Some(now);
        let _ = self.core.metadata.update_job(split_id, patch).await;
    }
}

#[async_trait::async_trait]
impl TaskHandler for SplitTaskHandler {
    async fn handle(&self, arguments: serde_json::Value) -> Result<(), TaskError> {
        let args: SplitTaskArgs = serde_json::from_value(arguments)
            .map_err(|e| TaskError::InvalidInput(format!("bad split task arguments: {e}")))?;
        let split_id = args.split_id;
        match self.run(args).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_split(split_id, e.message()).await;
                Err(e)
            }
        }
    }

    fn backoff_seconds(&self, attempt: u32) -> u64 {
        retry_delay_seconds(attempt)
    }
}
