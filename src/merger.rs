//! Merger (MERGE task handler): concatenate every PAGE
//! child's markdown in page-number order and finalize the MAIN job.
//!
//! Failed pages contribute no fragment but never abort the merge — the
//! MAIN completes with `pages_failed > 0` even if every page failed,
//! in which case the merged content is empty. Only a MERGE-level
//! failure (the metadata/search writes themselves failing) propagates
//! to the parent as a terminal failure.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob;
use crate::core::PipelineCore;
use crate::error::TaskError;
use crate::model::{JobPatch, JobType, Status};
use crate::queue::TaskHandler;
use crate::store::cache::StatusRecord;

pub const MAX_ATTEMPTS: i32 = 2;
const RETRY_BASE_SECONDS: u64 = 30;

pub fn retry_delay_seconds(attempt: u32) -> u64 {
    RETRY_BASE_SECONDS * 2u64.saturating_pow(attempt)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeTaskArgs {
    pub merge_id: Uuid,
    pub parent_id: Uuid,
}

pub struct MergeTaskHandler {
    core: Arc<PipelineCore>,
}

const FRAGMENT_SEPARATOR: &str = "\n\n---\n\n";

impl MergeTaskHandler {
    pub fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }

    async fn run(&self, args: MergeTaskArgs) -> Result<(), TaskError> {
        let now = Utc::now();
        let merge_id = args.merge_id;
        let parent_id = args.parent_id;

        let mut patch = JobPatch::new(now);
        patch.status = Some(Status::Processing);
        patch.started_at = Some(now);
        self.core.metadata.update_job(merge_id, patch).await?;
        self.core
            .cache
            .put_status(
                merge_id,
                StatusRecord {
                    job_type: JobType::Merge,
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

        let page_ids = self.core.cache.get_page_children(parent_id).await?;
        let mut fragments: Vec<(i32, String)> = Vec::with_capacity(page_ids.len());
        let mut word_count: i64 = 0;
        for page_id in page_ids {
            let Some(record) = self.core.cache.get_status(page_id).await? else {
                continue;
            };
            if record.status != Status::Completed {
                continue;
            }
            let Some(page_number) = record.page_number else {
                continue;
            };
            let Some(result) = self.core.cache.get_result(page_id).await? else {
                continue;
            };
            let markdown = result
                .get("markdown")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            word_count += markdown.split_whitespace().count() as i64;
            fragments.push((page_number, markdown));
        }
        fragments.sort_by_key(|(n, _)| *n);

        let combined = fragments
            .into_iter()
            .map(|(_, md)| md)
            .collect::<Vec<_>>()
            .join(FRAGMENT_SEPARATOR);
        let char_count = combined.len() as i64;

        let main = self
            .core
            .metadata
            .find_job(parent_id)
            .await?
            .ok_or_else(|| TaskError::Terminal(format!("main job {parent_id} not found")))?;

        self.core.cache.set_result(parent_id, serde_json::json!({ "markdown": combined.clone() })).await?;

        self.core
            .search
            .index(crate::search::SearchDocument {
                job_id: parent_id,
                user_id: main.user_id.clone(),
                filename: main.filename.clone(),
                content: combined.clone(),
            })
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;

        let result_key = blob::result_key(parent_id);
        if let Err(e) = self.core.blobs.store(&result_key, combined.as_bytes()).await {
            tracing::warn!(main_id = %parent_id, error = %e, "best-effort merged result blob write failed");
        }

        let completed_at = Utc::now();
        let mut main_patch = JobPatch::new(completed_at);
        main_patch.status = Some(Status::Completed);
        main_patch.progress_percent = Some(100);
        main_patch.char_count = Some(Some(char_count));
        main_patch.has_result_stored = Some(true);
        main_patch.result_object_key = Some(Some(result_key));
        main_patch.completed_at = Some(completed_at);
        self.core.metadata.update_job(parent_id, main_patch).await?;
        self.core
            .cache
            .put_status(
                parent_id,
                StatusRecord {
                    job_type: JobType::Main,
                    status: Status::Completed,
                    progress: 100,
                    name: main.filename.clone(),
                    page_number: None,
                    parent_job_id: None,
                    started_at: main.started_at,
                    completed_at: Some(completed_at),
                    error: None,
                },
            )
            .await?;

        let mut merge_patch = JobPatch::new(completed_at);
        merge_patch.status = Some(Status::Completed);
        merge_patch.progress_percent = Some(100);
        merge_patch.completed_at = Some(completed_at);
        self.core.metadata.update_job(merge_id, merge_patch).await?;
        self.core
            .cache
            .put_status(
                merge_id,
                StatusRecord {
                    job_type: JobType::Merge,
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

        self.core.remove_scratch_dir(parent_id).await;
        Ok(())
    }

    async fn fail_merge_and_main(&self, merge_id: Uuid, parent_id: Uuid, message: String) {
        let now = Utc::now();

        let mut merge_patch = JobPatch::new(now);
        merge_patch.status = Some(Status::Failed);
        merge_patch.error_message = Some(Some(message.clone()));
        merge_patch.completed_at = Some(now);
        let _ = self.core.metadata.update_job(merge_id, merge_patch).await;
        let _ = self
            .core
            .cache
            .put_status(
                merge_id,
                StatusRecord {
                    job_type: JobType::Merge,
                    status: Status::Failed,
                    progress: 0,
                    name: None,
                    page_number: None,
                    parent_job_id: Some(parent_id),
                    started_at: None,
                    completed_at: Some(now),
                    error: Some(message.clone()),
                },
            )
            .await;

        let mut main_patch = JobPatch::new(now);
        main_patch.status = Some(Status::Failed);
        main_patch.error_message = Some(Some(format!("merge failed: {message}")));
        main_patch.completed_at = Some(now);
        let _ = self.core.metadata.update_job(parent_id, main_patch).await;
        let _ = self
            .core
            .cache
            .put_status(
                parent_id,
                StatusRecord {
                    job_type: JobType::Main,
                    status: Status::Failed,
                    progress: 0,
                    name: None,
                    page_number: None,
                    parent_job_id: None,
                    started_at: None,
                    completed_at: Some(now),
                    error: Some(format!("merge failed: {message}")),
                },
            )
            .await;

        self.core.remove_scratch_dir(parent_id).await;
    }
}

#[async_trait::async_trait]
impl TaskHandler for MergeTaskHandler {
    async fn handle(&self, arguments: serde_json::Value) -> Result<(), TaskError> {
        let args: MergeTaskArgs = serde_json::from_value(arguments)
            .map_err(|e| TaskError::InvalidInput(format!("bad merge task arguments: {e}")))?;
        let merge_id = args.merge_id;
        let parent_id = args.parent_id;
        match self.run(args).await {
            Ok(()) => Ok(()),
            Err(e @ TaskError::Terminal(_)) => Err(e),
            Err(e) => {
                self.fail_merge_and_main(merge_id, parent_id, e.message()).await;
                Err(e)
            }
        }
    }

    fn backoff_seconds(&self, attempt: u32) -> u64 {
        retry_delay_seconds(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::collaborators::{FakeDocumentConverter, FakePageExtractor, FakeTranscriber};
    use crate::config::PipelineConfig;
    use crate::error::QueueError;
    use crate::model::{Job, SourceType};
    use crate::queue::Queue;
    use crate::search::InMemoryResultIndex;
    use crate::store::{ChildRole, InMemoryMetadataStore, InMemoryStatusCache};

    struct NullQueue;

    #[async_trait::async_trait]
    impl Queue for NullQueue {
        async fn enqueue(&self, _: &str, _: serde_json::Value, _: i32) -> Result<Uuid, QueueError> {
            Ok(Uuid::new_v4())
        }
        async fn enqueue_periodic(&self, _: &str, _: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn build_core() -> Arc<PipelineCore> {
        Arc::new(PipelineCore::new(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryStatusCache::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryResultIndex::new()),
            Arc::new(NullQueue),
            Arc::new(FakeDocumentConverter),
            Arc::new(FakeTranscriber),
            Arc::new(FakePageExtractor::default()),
            PipelineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn merge_concatenates_pages_in_order_and_skips_failed() {
        let core = build_core();
        let now = Utc::now();
        let main = Job::new_main("user-1", SourceType::File, None, None, None, None, None, now);
        let main = core.metadata.create_job(main).await.unwrap();

        for (page_number, status, markdown) in [
            (1, Status::Completed, "first"),
            (2, Status::Failed, ""),
            (3, Status::Completed, "third"),
        ] {
            let page_id = Uuid::new_v4();
            core.cache.add_child(main.job_id, ChildRole::Page, page_id).await.unwrap();
            core.cache
                .put_status(
                    page_id,
                    StatusRecord {
                        job_type: JobType::Page,
                        status,
                        progress: 100,
                        name: None,
                        page_number: Some(page_number),
                        parent_job_id: Some(main.job_id),
                        started_at: None,
                        completed_at: Some(now),
                        error: None,
                    },
                )
                .await
                .unwrap();
            if status == Status::Completed {
                core.cache
                    .set_result(page_id, serde_json::json!({ "markdown": markdown }))
                    .await
                    .unwrap();
            }
        }

        let merge_id = Uuid::new_v4();
        let mut merge_job = Job::new_child(JobType::Merge, &main, None, now);
        merge_job.job_id = merge_id;
        core.metadata.create_job(merge_job).await.unwrap();

        let handler = MergeTaskHandler::new(core.clone());
        handler
            .run(MergeTaskArgs { merge_id, parent_id: main.job_id })
            .await
            .unwrap();

        let result = core.cache.get_result(main.job_id).await.unwrap().unwrap();
        assert_eq!(result["markdown"], serde_json::json!("first\n\n---\n\nthird"));

        let updated_main = core.metadata.find_job(main.job_id).await.unwrap().unwrap();
        assert_eq!(updated_main.status, Status::Completed);
    }

    #[tokio::test]
    async fn merge_completes_main_with_empty_content_when_every_page_failed() {
        let core = build_core();
        let now = Utc::now();
        let main = Job::new_main("user-1", SourceType::File, None, None, None, None, None, now);
        let main = core.metadata.create_job(main).await.unwrap();

        let page_id = Uuid::new_v4();
        core.cache.add_child(main.job_id, ChildRole::Page, page_id).await.unwrap();
        core.cache
            .put_status(
                page_id,
                StatusRecord {
                    job_type: JobType::Page,
                    status: Status::Failed,
                    progress: 0,
                    name: None,
                    page_number: Some(1),
                    parent_job_id: Some(main.job_id),
                    started_at: None,
                    completed_at: Some(now),
                    error: Some("boom".to_string()),
                },
            )
            .await
            .unwrap();

        let merge_id = Uuid::new_v4();
        let mut merge_job = Job::new_child(JobType::Merge, &main, None, now);
        merge_job.job_id = merge_id;
        core.metadata.create_job(merge_job).await.unwrap();

        let handler = MergeTaskHandler::new(core.clone());
        handler
            .run(MergeTaskArgs { merge_id, parent_id: main.job_id })
            .await
            .unwrap();

        let result = core.cache.get_result(main.job_id).await.unwrap().unwrap();
        assert_eq!(result["markdown"], serde_json::json!(""));

        let updated_main = core.metadata.find_job(main.job_id).await.unwrap().unwrap();
        assert_eq!(updated_main.status, Status::Completed);
        assert_eq!(updated_main.char_count, Some(0));
    }
}
