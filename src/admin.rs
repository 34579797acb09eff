//! Admin surface: single-shot variants of the monitor
//! sweeps plus aggregate stats, exposed as plain functions over the
//! same gateways rather than a separate subsystem.

use chrono::Utc;
use uuid::Uuid;

use crate::core::PipelineCore;
use crate::error::TaskError;
use crate::model::{Job, JobType, Page, Status};
use crate::monitor::{self, AutoRetrySweepOutcome, StuckSweepOutcome};

pub struct SystemStats {
    pub status_histogram: Vec<(JobType, Status, i64)>,
    pub stuck_jobs: usize,
    pub stuck_pages: usize,
}

pub async fn list_stuck_jobs(
    core: &PipelineCore,
    threshold: Option<chrono::Duration>,
    limit: i64,
) -> Result<Vec<Job>, TaskError> {
    let threshold = threshold.unwrap_or_else(|| core.config.stuck_threshold());
    Ok(core.metadata.list_stuck_jobs(Utc::now() - threshold, limit).await?)
}

/// Runs the stuck-job sweep once, outside its regular cadence.
pub async fn trigger_stuck_recovery(core: &PipelineCore) -> Result<StuckSweepOutcome, TaskError> {
    monitor::stuck_job_sweep(core).await
}

/// Runs the auto-retry logic scoped to one parent's failed pages.
pub async fn bulk_retry_failed_pages(core: &PipelineCore, main_id: Uuid) -> Result<AutoRetrySweepOutcome, TaskError> {
    let pages: Vec<Page> = core
        .metadata
        .list_retryable_failed_pages_for(main_id, core.config.monitoring_max_retry_count)
        .await?;

    let mut outcome = AutoRetrySweepOutcome::default();
    let upload_key = core.metadata.find_job(main_id).await?.and_then(|j| j.upload_object_key);
    let has_upload = match &upload_key {
        Some(key) => core.blobs.exists(key).await.unwrap_or(false),
        None => false,
    };

    let handler = crate::page_task::PageTaskHandler::new(std::sync::Arc::new(core.clone()));

    for page in pages {
        if !has_upload {
            let message = "original upload artifact missing, requires manual recovery".to_string();
            tracing::warn!(
                page_id = %page.page_id,
                main_id = %main_id,
                "original upload artifact missing, resetting page to PENDING for manual recovery"
            );

            let mut patch = crate::model::PagePatch::new(Utc::now());
            patch.page_job_id = Some(crate::clock::new_id());
            patch.status = Some(Status::Pending);
            patch.retry_count = Some(page.retry_count + 1);
            patch.error_message = Some(Some(message));
            core.metadata.update_page(page.page_id, patch).await?;

            outcome.skipped_missing_upload += 1;
            continue;
        }

        match handler.process_page(main_id, page.page_number).await {
            Ok(_) => outcome.retried += 1,
            Err(e) => tracing::error!(page_id = %page.page_id, main_id = %main_id, error = %e, "bulk retry requeue failed"),
        }
    }

    Ok(outcome)
}

/// Runs the cleanup sweep once, optionally overriding the configured
/// cleanup horizon (in days).
pub async fn cleanup(core: &PipelineCore, days: Option<i64>) -> Result<usize, TaskError> {
    match days {
        None => monitor::cleanup_sweep(core).await,
        Some(days) => {
            let older_than = Utc::now() - chrono::Duration::days(days);
            let jobs = core
                .metadata
                .list_cleanup_candidates(older_than, core.config.monitoring_batch_size)
                .await?;
            for job in &jobs {
                core.cache.purge(job.job_id).await?;
            }
            Ok(jobs.len())
        }
    }
}

pub async fn system_stats(core: &PipelineCore) -> Result<SystemStats, TaskError> {
    let status_histogram = core.metadata.status_histogram().await?;
    let threshold = Utc::now() - core.config.stuck_threshold();
    let stuck_jobs = core.metadata.list_stuck_jobs(threshold, core.config.monitoring_batch_size).await?.len();
    let stuck_pages = core.metadata.list_stuck_pages(threshold, core.config.monitoring_batch_size).await?.len();
    Ok(SystemStats { status_histogram, stuck_jobs, stuck_pages })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::collaborators::{FakeDocumentConverter, FakePageExtractor, FakeTranscriber};
    use crate::config::PipelineConfig;
    use crate::model::SourceType;
    use crate::queue::Queue;
    use crate::search::InMemoryResultIndex;
    use crate::store::{InMemoryMetadataStore, InMemoryStatusCache};

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

    fn build_core() -> PipelineCore {
        PipelineCore::new(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryStatusCache::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryResultIndex::new()),
            Arc::new(NullQueue),
            Arc::new(FakeDocumentConverter),
            Arc::new(FakeTranscriber),
            Arc::new(FakePageExtractor::default()),
            PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn system_stats_counts_by_type_and_status() {
        let core = build_core();
        let now = Utc::now();
        let mut a = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("a".to_string()), now);
        a.status = Status::Completed;
        core.metadata.create_job(a).await.unwrap();
        let mut b = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("b".to_string()), now);
        b.status = Status::Completed;
        core.metadata.create_job(b).await.unwrap();

        let stats = system_stats(&core).await.unwrap();
        let completed_mains = stats
            .status_histogram
            .iter()
            .find(|(t, s, _)| *t == JobType::Main && *s == Status::Completed)
            .map(|(_, _, n)| *n)
            .unwrap_or(0);
        assert_eq!(completed_mains, 2);
    }

    #[tokio::test]
    async fn bulk_retry_failed_pages_scopes_to_one_parent() {
        let core = build_core();
        let now = Utc::now();
        let mut main = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("c".to_string()), now);
        main.upload_object_key = Some("uploads/main/source.pdf".to_string());
        let main = core.metadata.create_job(main).await.unwrap();
        core.blobs.store("uploads/main/source.pdf", b"pdf bytes").await.unwrap();

        let page_job = Job::new_child(JobType::Page, &main, Some(1), now);
        let mut page = Page::new(main.job_id, 1, page_job.job_id, "pages/x/page_0001.pdf", now);
        page.status = Status::Failed;
        core.metadata.create_page(page).await.unwrap();

        let outcome = bulk_retry_failed_pages(&core, main.job_id).await.unwrap();
        assert_eq!(outcome.retried, 1);
    }

    #[tokio::test]
    async fn bulk_retry_failed_pages_resets_page_when_upload_is_gone() {
        let core = build_core();
        let now = Utc::now();
        let mut main = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("c".to_string()), now);
        main.upload_object_key = Some("uploads/main/missing.pdf".to_string());
        let main = core.metadata.create_job(main).await.unwrap();

        let page_job = Job::new_child(JobType::Page, &main, Some(1), now);
        let original_page_job_id = page_job.job_id;
        let mut page = Page::new(main.job_id, 1, original_page_job_id, "pages/x/page_0001.pdf", now);
        page.status = Status::Failed;
        page.retry_count = 1;
        let page = core.metadata.create_page(page).await.unwrap();

        let outcome = bulk_retry_failed_pages(&core, main.job_id).await.unwrap();
        assert_eq!(outcome.retried, 0);
        assert_eq!(outcome.skipped_missing_upload, 1);

        let reloaded = core.metadata.find_page(page.page_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, Status::Pending);
        assert_eq!(reloaded.retry_count, 2);
        assert_ne!(reloaded.page_job_id, original_page_job_id);
    }
}
