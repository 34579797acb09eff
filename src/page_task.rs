//! Page task (PAGE task handler): convert one page, persist
//! the result three ways, recompute the parent counter race-free, then
//! run the aggregator check. Also the retry entry point
//! (`process_page`) used when a specific failed page is re-attempted.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborators::ConversionOptions;
use crate::core::fan_out_progress;
use crate::core::PipelineCore;
use crate::error::TaskError;
use crate::model::{JobPatch, JobType, PagePatch, Status};
use crate::options::SubmissionOptions;
use crate::queue::TaskHandler;
use crate::store::cache::StatusRecord;
use crate::store::CounterKind;

pub const MAX_ATTEMPTS: i32 = 3;
const RETRY_BASE_SECONDS: u64 = 30;
pub const MAX_PAGE_RETRIES: i32 = 3;

pub fn retry_delay_seconds(attempt: u32) -> u64 {
    RETRY_BASE_SECONDS * 2u64.saturating_pow(attempt)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageTaskArgs {
    pub page_job_id: Uuid,
    pub parent_id: Uuid,
    pub page_number: i32,
    pub page_file_path: String,
    pub options: SubmissionOptions,
}

pub struct PageTaskHandler {
    core: Arc<PipelineCore>,
}

impl PageTaskHandler {
    pub fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }

    async fn run(&self, args: PageTaskArgs) -> Result<(), TaskError> {
        let now = Utc::now();

        self.core
            .cache
            .put_status(
                args.page_job_id,
                StatusRecord {
                    job_type: JobType::Page,
                    status: Status::Processing,
                    progress: 0,
                    name: None,
                    page_number: Some(args.page_number),
                    parent_job_id: Some(args.parent_id),
                    started_at: Some(now),
                    completed_at: None,
                    error: None,
                },
            )
            .await?;

        let mut processing_patch = PagePatch::new(now);
        processing_patch.status = Some(Status::Processing);
        self.core
            .metadata
            .transition_page(
                args.parent_id,
                args.page_number,
                processing_patch,
                CounterKind::Completed,
            )
            .await?;

        let conversion_options = ConversionOptions {
            docling_preset: args
                .options
                .docling_preset
                .map(|p| format!("{p:?}").to_lowercase())
                .unwrap_or_else(|| self.core.config.docling_preset.clone()),
        };

        let result = self
            .core
            .converter
            .convert(std::path::Path::new(&args.page_file_path), &conversion_options)
            .await?;
        let markdown = result.markdown;
        let char_count = markdown.len() as i64;

        self.core
            .cache
            .set_result(args.page_job_id, serde_json::json!({ "markdown": markdown.clone() }))
            .await?;

        let main = self
            .core
            .metadata
            .find_job(args.parent_id)
            .await?
            .ok_or_else(|| TaskError::Terminal(format!("main job {} not found", args.parent_id)))?;

        self.core
            .search
            .index(crate::search::SearchDocument {
                job_id: args.page_job_id,
                user_id: main.user_id.clone(),
                filename: main.filename.clone(),
                content: markdown.clone(),
            })
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;

        let result_key = format!("results/{}/page_{:04}.md", args.parent_id, args.page_number);
        if let Err(e) = self.core.blobs.store(&result_key, markdown.as_bytes()).await {
            tracing::warn!(page_job_id = %args.page_job_id, error = %e, "best-effort page result blob write failed");
        }

        let completed_at = Utc::now();
        let mut page_patch = PagePatch::new(completed_at);
        page_patch.status = Some(Status::Completed);
        page_patch.markdown_content = Some(Some(markdown));
        page_patch.char_count = Some(Some(char_count));
        page_patch.has_result_stored = Some(true);
        page_patch.completed_at = Some(completed_at);

        let (_, main) = self
            .core
            .metadata
            .transition_page(args.parent_id, args.page_number, page_patch, CounterKind::Completed)
            .await?;

        self.core
            .cache
            .put_status(
                args.page_job_id,
                StatusRecord {
                    job_type: JobType::Page,
                    status: Status::Completed,
                    progress: 100,
                    name: None,
                    page_number: Some(args.page_number),
                    parent_job_id: Some(args.parent_id),
                    started_at: Some(now),
                    completed_at: Some(completed_at),
                    error: None,
                },
            )
            .await?;

        let total = main.total_pages.unwrap_or(0);
        let progress = fan_out_progress(main.pages_completed, total);
        let mut main_patch = JobPatch::new(Utc::now());
        main_patch.progress_percent = Some(progress);
        self.core.metadata.update_job(args.parent_id, main_patch).await?;
        self.core.cache.update_progress(args.parent_id, progress).await?;

        crate::aggregator::check_and_trigger_merge(&self.core, args.parent_id).await?;

        Ok(())
    }

    async fn fail_page(&self, args: &PageTaskArgs, message: String) {
        let now = Utc::now();
        let mut patch = PagePatch::new(now);
        patch.status = Some(Status::Failed);
        patch.error_message = Some(Some(message.clone()));
        patch.completed_at = Some(now);

        let outcome = self
            .core
            .metadata
            .transition_page(args.parent_id, args.page_number, patch, CounterKind::Failed)
            .await;

        let _ = self
            .core
            .cache
            .put_status(
                args.page_job_id,
                StatusRecord {
                    job_type: JobType::Page,
                    status: Status::Failed,
                    progress: 0,
                    name: None,
                    page_number: Some(args.page_number),
                    parent_job_id: Some(args.parent_id),
                    started_at: None,
                    completed_at: Some(now),
                    error: Some(message),
                },
            )
            .await;

        if outcome.is_ok() {
            let _ = crate::aggregator::check_and_trigger_merge(&self.core, args.parent_id).await;
        }
    }

    /// Retry entry point: re-extracts the
    /// page from the original upload, assigns a fresh `page_job_id`,
    /// resets the Page row to PENDING, and re-enqueues.
    pub async fn process_page(&self, main_id: Uuid, page_number: i32) -> Result<Uuid, TaskError> {
        let page = self
            .core
            .metadata
            .find_page_by_number(main_id, page_number)
            .await?
            .ok_or_else(|| TaskError::InvalidInput(format!("page {page_number} of {main_id} not found")))?;

        if !page.can_retry(MAX_PAGE_RETRIES) {
            return Err(TaskError::Terminal(format!(
                "page {page_number} of {main_id} exceeded retry ceiling"
            )));
        }

        let main = self
            .core
            .metadata
            .find_job(main_id)
            .await?
            .ok_or_else(|| TaskError::Terminal(format!("main job {main_id} not found")))?;
        let upload_key = main
            .upload_object_key
            .ok_or_else(|| TaskError::Terminal("original upload blob is gone, cannot re-extract page".to_string()))?;

        let scratch = self.core.scratch_dir(main_id);
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;
        let local_upload = scratch.join("source");
        let bytes = self.core.blobs.fetch(&upload_key).await.map_err(TaskError::from)?;
        tokio::fs::write(&local_upload, &bytes)
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;

        let extracted = self
            .core
            .page_extractor
            .extract_one(&local_upload, page_number, main_id)
            .await
            .map_err(TaskError::from)?;

        let new_page_job_id = crate::clock::new_id();
        let mut patch = PagePatch::new(Utc::now());
        patch.page_job_id = Some(new_page_job_id);
        patch.status = Some(Status::Pending);
        patch.retry_count = Some(page.retry_count + 1);
        patch.error_message = Some(None);
        self.core.metadata.update_page(page.page_id, patch).await?;

        self.core
            .cache
            .put_status(
                new_page_job_id,
                StatusRecord {
                    job_type: JobType::Page,
                    status: Status::Queued,
                    progress: 0,
                    name: None,
                    page_number: Some(page_number),
                    parent_job_id: Some(main_id),
                    started_at: None,
                    completed_at: None,
                    error: None,
                },
            )
            .await?;
        self.core
            .cache
            .set_page_child_by_number(main_id, page_number, new_page_job_id)
            .await?;

        let args = PageTaskArgs {
            page_job_id: new_page_job_id,
            parent_id: main_id,
            page_number,
            page_file_path: extracted.local_path.display().to_string(),
            options: SubmissionOptions::default(),
        };
        self.core
            .queue
            .enqueue(
                "page",
                serde_json::to_value(args).expect("PageTaskArgs always serializes"),
                MAX_ATTEMPTS,
            )
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;

        Ok(new_page_job_id)
    }
}

#[async_trait::async_trait]
impl TaskHandler for PageTaskHandler {
    async fn handle(&self, arguments: serde_json::Value) -> Result<(), TaskError> {
        let args: PageTaskArgs = serde_json::from_value(arguments)
            .map_err(|e| TaskError::InvalidInput(format!("bad page task arguments: {e}")))?;
        match self.run(args.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_page(&args, e.message()).await;
                Err(e)
            }
        }
    }

    fn backoff_seconds(&self, attempt: u32) -> u64 {
        retry_delay_seconds(attempt)
    }
}
