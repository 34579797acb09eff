//! Query and command operations against the gateways: the
//! read side (`get_job`, `get_result`, `search`, ...) plus the three
//! user-facing commands that are not full task handlers (`delete`,
//! `retry_page`, `cancel`).

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::core::PipelineCore;
use crate::error::{CacheError, SearchError, StoreError, TaskError};
use crate::model::{Job, JobPatch, Page, Status};
use crate::page_task::PageTaskHandler;
use crate::search::SearchHit;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("page {page_number} of {main_id} not found")]
    PageNotFound { main_id: Uuid, page_number: i32 },

    #[error("result not available for job {0}")]
    ResultNotAvailable(Uuid),

    #[error("job {0} is not cancellable in its current state")]
    NotCancellable(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// `get_job`'s return shape: the MAIN (or any job) row plus its
/// per-page sub-status list, optionally windowed.
pub struct JobDetail {
    pub job: Job,
    pub pages: Vec<Page>,
}

pub async fn get_job(
    core: &PipelineCore,
    main_id: Uuid,
    window: Option<(usize, usize)>,
) -> Result<JobDetail, QueryError> {
    let job = core.metadata.find_job(main_id).await?.ok_or(QueryError::JobNotFound(main_id))?;
    let mut pages = core.metadata.find_pages(main_id).await?;
    if let Some((offset, limit)) = window {
        pages = pages.into_iter().skip(offset).take(limit).collect();
    }
    Ok(JobDetail { job, pages })
}

pub async fn get_page(core: &PipelineCore, main_id: Uuid, page_number: i32) -> Result<Page, QueryError> {
    core.metadata
        .find_page_by_number(main_id, page_number)
        .await?
        .ok_or(QueryError::PageNotFound { main_id, page_number })
}

/// Markdown + metadata for a completed job; refuses anything not yet
/// COMPLETED, matching the "404 unless COMPLETED" contract.
pub async fn get_result(core: &PipelineCore, job_id: Uuid) -> Result<String, QueryError> {
    let job = core.metadata.find_job(job_id).await?.ok_or(QueryError::JobNotFound(job_id))?;
    if job.status != Status::Completed {
        return Err(QueryError::ResultNotAvailable(job_id));
    }

    if let Some(cached) = core.cache.get_result(job_id).await? {
        if let Some(markdown) = cached.get("markdown").and_then(|v| v.as_str()) {
            return Ok(markdown.to_string());
        }
    }

    let key = job.result_object_key.ok_or(QueryError::ResultNotAvailable(job_id))?;
    let bytes = core.blobs.fetch(&key).await.map_err(|e| {
        tracing::warn!(job_id = %job_id, error = %e, "result blob missing despite COMPLETED status");
        QueryError::ResultNotAvailable(job_id)
    })?;
    String::from_utf8(bytes).map_err(|_| QueryError::ResultNotAvailable(job_id))
}

pub async fn get_page_result(core: &PipelineCore, main_id: Uuid, page_number: i32) -> Result<String, QueryError> {
    let page = get_page(core, main_id, page_number).await?;
    if page.status != Status::Completed {
        return Err(QueryError::ResultNotAvailable(page.page_job_id));
    }
    if let Some(markdown) = page.markdown_content {
        return Ok(markdown);
    }
    if let Some(cached) = core.cache.get_result(page.page_job_id).await? {
        if let Some(markdown) = cached.get("markdown").and_then(|v| v.as_str()) {
            return Ok(markdown.to_string());
        }
    }
    Err(QueryError::ResultNotAvailable(page.page_job_id))
}

pub async fn list_user_jobs(core: &PipelineCore, user_id: &str, limit: usize) -> Result<Vec<Job>, QueryError> {
    let ids = core.cache.list_user_jobs(user_id, limit).await?;
    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(job) = core.metadata.find_job(id).await? {
            jobs.push(job);
        }
    }
    Ok(jobs)
}

pub async fn search(core: &PipelineCore, user_id: &str, query: &str, limit: usize) -> Result<Vec<SearchHit>, QueryError> {
    Ok(core.search.search(user_id, query, limit).await?)
}

/// Cascade delete. Index removal is best-effort: a failure there is
/// logged, not propagated, so an unavailable result index never blocks
/// a delete.
pub async fn delete(core: &PipelineCore, main_id: Uuid) -> Result<(), QueryError> {
    if let Err(e) = core.search.remove(main_id).await {
        tracing::warn!(main_id = %main_id, error = %e, "best-effort search index removal failed");
    }
    let pages = core.metadata.find_pages(main_id).await?;
    for page in pages {
        if let Err(e) = core.search.remove(page.page_job_id).await {
            tracing::warn!(page_job_id = %page.page_job_id, error = %e, "best-effort search index removal failed");
        }
    }
    core.cache.purge(main_id).await?;
    core.metadata.delete_cascade(main_id).await?;
    Ok(())
}

/// Retries one failed page; bounded by the retry ceiling inside
/// [`PageTaskHandler::process_page`].
pub async fn retry_page(core: &Arc<PipelineCore>, main_id: Uuid, page_number: i32) -> Result<Uuid, QueryError> {
    let handler = PageTaskHandler::new(Arc::clone(core));
    handler.process_page(main_id, page_number).await.map_err(QueryError::Task)
}

/// Status transition only: QUEUED/PROCESSING -> CANCELLED, terminal,
/// never retried. Running workers detect the transition opportunistically
/// on their next persistence call.
pub async fn cancel(core: &PipelineCore, main_id: Uuid) -> Result<(), QueryError> {
    let job = core.metadata.find_job(main_id).await?.ok_or(QueryError::JobNotFound(main_id))?;
    if !matches!(job.status, Status::Queued | Status::Processing) {
        return Err(QueryError::NotCancellable(main_id));
    }

    let now = Utc::now();
    let mut patch = JobPatch::new(now);
    patch.status = Some(Status::Cancelled);
    patch.completed_at = Some(now);
    core.metadata.update_job(main_id, patch).await?;
    core.cache.update_progress(main_id, job.progress_percent).await?;
    if let Some(mut record) = core.cache.get_status(main_id).await? {
        record.status = Status::Cancelled;
        record.completed_at = Some(now);
        core.cache.put_status(main_id, record).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::collaborators::{FakeDocumentConverter, FakePageExtractor, FakeTranscriber};
    use crate::config::PipelineConfig;
    use crate::model::{JobType, SourceType};
    use crate::queue::Queue;
    use crate::search::InMemoryResultIndex;
    use crate::store::cache::StatusRecord;
    use crate::store::{ChildRole, InMemoryMetadataStore, InMemoryStatusCache};

    struct NullQueue;

    #[async_trait::async_trait]
    impl Queue for NullQueue {
        async fn enqueue(
            &self,
            _task_name: &str,
            _arguments: serde_json::Value,
            _max_attempts: i32,
        ) -> Result<Uuid, crate::error::QueueError> {
            Ok(Uuid::new_v4())
        }

        async fn enqueue_periodic(&self, _task_name: &str, _cron: &str) -> Result<(), crate::error::QueueError> {
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

    async fn completed_main(core: &Arc<PipelineCore>) -> Uuid {
        let now = Utc::now();
        let mut job = Job::new_main(
            "user-1",
            SourceType::File,
            None,
            Some("a.pdf".to_string()),
            None,
            None,
            Some("chk".to_string()),
            now,
        );
        job.status = Status::Completed;
        job.result_object_key = Some("results/job/combined.md".to_string());
        let job = core.metadata.create_job(job).await.unwrap();
        core.cache
            .set_result(job.job_id, serde_json::json!({ "markdown": "hello world" }))
            .await
            .unwrap();
        job.job_id
    }

    #[tokio::test]
    async fn get_result_rejects_non_completed_job() {
        let core = build_core();
        let now = Utc::now();
        let job = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("c".to_string()), now);
        let job = core.metadata.create_job(job).await.unwrap();

        let err = get_result(&core, job.job_id).await.unwrap_err();
        assert!(matches!(err, QueryError::ResultNotAvailable(_)));
    }

    #[tokio::test]
    async fn get_result_reads_from_cache_when_completed() {
        let core = build_core();
        let job_id = completed_main(&core).await;
        let markdown = get_result(&core, job_id).await.unwrap();
        assert_eq!(markdown, "hello world");
    }

    #[tokio::test]
    async fn cancel_transitions_queued_job_to_cancelled() {
        let core = build_core();
        let now = Utc::now();
        let mut job = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("c".to_string()), now);
        job.status = Status::Queued;
        let job = core.metadata.create_job(job).await.unwrap();

        cancel(&core, job.job_id).await.unwrap();

        let reloaded = core.metadata.find_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, Status::Cancelled);
    }

    #[tokio::test]
    async fn cancel_rejects_already_completed_job() {
        let core = build_core();
        let job_id = completed_main(&core).await;
        let err = cancel(&core, job_id).await.unwrap_err();
        assert!(matches!(err, QueryError::NotCancellable(_)));
    }

    #[tokio::test]
    async fn delete_removes_job_and_its_pages() {
        let core = build_core();
        let now = Utc::now();
        let main = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("c".to_string()), now);
        let main = core.metadata.create_job(main).await.unwrap();

        let page_job = Job::new_child(JobType::Page, &main, Some(1), now);
        let page = Page::new(main.job_id, 1, page_job.job_id, "pages/x/page_0001.pdf", now);
        core.metadata.create_page(page).await.unwrap();
        core.cache.add_child(main.job_id, ChildRole::Page, page_job.job_id).await.unwrap();
        core.cache
            .put_status(
                main.job_id,
                StatusRecord {
                    job_type: JobType::Main,
                    status: Status::Completed,
                    progress: 100,
                    name: None,
                    page_number: None,
                    parent_job_id: None,
                    started_at: None,
                    completed_at: Some(now),
                    error: None,
                },
            )
            .await
            .unwrap();

        delete(&core, main.job_id).await.unwrap();

        assert!(core.metadata.find_job(main.job_id).await.unwrap().is_none());
        assert!(core.metadata.find_pages(main.job_id).await.unwrap().is_empty());
        assert!(core.cache.get_status(main.job_id).await.unwrap().is_none());
    }
}
