//! Monitor loop: stuck-job recovery, auto-retry, cleanup,
//! and a heartbeat, each on its own cadence, driven by a
//! shutdown-aware `tokio::select!` over independent interval timers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::core::PipelineCore;
use crate::error::TaskError;
use crate::model::{JobPatch, PagePatch, Status};
use crate::store::CounterKind;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const HEALTH_BEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, Copy)]
pub struct StuckSweepOutcome {
    pub jobs_failed: usize,
    pub pages_failed: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AutoRetrySweepOutcome {
    pub retried: usize,
    pub skipped_missing_upload: usize,
}

/// Sweep 1: PROCESSING jobs/pages idle past the stuck threshold are
/// marked FAILED in both stores.
pub async fn stuck_job_sweep(core: &PipelineCore) -> Result<StuckSweepOutcome, TaskError> {
    let older_than = Utc::now() - core.config.stuck_threshold();
    let limit = core.config.monitoring_batch_size;
    let message = format!(
        "stuck in processing for >{}min",
        core.config.monitoring_stuck_job_threshold_minutes
    );

    let mut outcome = StuckSweepOutcome::default();

    for job in core.metadata.list_stuck_jobs(older_than, limit).await? {
        let now = Utc::now();
        let mut patch = JobPatch::new(now);
        patch.status = Some(Status::Failed);
        patch.error_message = Some(Some(message.clone()));
        patch.completed_at = Some(now);
        core.metadata.update_job(job.job_id, patch).await?;

        if let Some(mut record) = core.cache.get_status(job.job_id).await? {
            record.status = Status::Failed;
            record.error = Some(message.clone());
            record.completed_at = Some(now);
            core.cache.put_status(job.job_id, record).await?;
        }
        outcome.jobs_failed += 1;
    }

    for page in core.metadata.list_stuck_pages(older_than, limit).await? {
        let now = Utc::now();
        let mut patch = PagePatch::new(now);
        patch.status = Some(Status::Failed);
        patch.error_message = Some(Some(message.clone()));
        patch.completed_at = Some(now);
        // Recomputes pages_failed via the same COUNT-in-transaction
        // primitive used by the normal PAGE task path.
        core.metadata
            .transition_page(page.job_id, page.page_number, patch, CounterKind::Failed)
            .await?;

        if let Some(mut record) = core.cache.get_status(page.page_job_id).await? {
            record.status = Status::Failed;
            record.error = Some(message.clone());
            record.completed_at = Some(now);
            core.cache.put_status(page.page_job_id, record).await?;
        }
        outcome.pages_failed += 1;
    }

    Ok(outcome)
}

/// Sweep 2: FAILED pages under the retry ceiling are re-extracted from
/// the original upload and requeued under a fresh `page_job_id`,
/// provided that upload blob still exists. If it doesn't, the page is
/// still reset to PENDING with its retry counter bumped and a fresh
/// `page_job_id`, but nothing is enqueued for it; the diagnostic is
/// logged and left on the row for manual recovery.
pub async fn auto_retry_sweep(core: &PipelineCore) -> Result<AutoRetrySweepOutcome, TaskError> {
    let pages = core
        .metadata
        .list_retryable_failed_pages(core.config.monitoring_max_retry_count, core.config.monitoring_batch_size)
        .await?;

    let mut outcome = AutoRetrySweepOutcome::default();
    let handler = crate::page_task::PageTaskHandler::new(Arc::new(core.clone()));

    for page in pages {
        let upload_key = core.metadata.find_job(page.job_id).await?.and_then(|j| j.upload_object_key);
        let has_upload = match &upload_key {
            Some(key) => core.blobs.exists(key).await.unwrap_or(false),
            None => false,
        };

        if !has_upload {
            let message = "original upload artifact missing, requires manual recovery".to_string();
            tracing::warn!(
                page_id = %page.page_id,
                main_id = %page.job_id,
                "original upload artifact missing, resetting page to PENDING for manual recovery"
            );

            let mut patch = PagePatch::new(Utc::now());
            patch.page_job_id = Some(crate::clock::new_id());
            patch.status = Some(Status::Pending);
            patch.retry_count = Some(page.retry_count + 1);
            patch.error_message = Some(Some(message));
            core.metadata.update_page(page.page_id, patch).await?;

            outcome.skipped_missing_upload += 1;
            continue;
        }

        match handler.process_page(page.job_id, page.page_number).await {
            Ok(_) => outcome.retried += 1,
            Err(e) => tracing::error!(
                page_id = %page.page_id,
                main_id = %page.job_id,
                error = %e,
                "auto-retry requeue failed"
            ),
        }
    }

    Ok(outcome)
}

/// Sweep 3: terminal MAIN jobs past the cleanup horizon have their
/// status-cache keys purged. Metadata rows and blobs are preserved.
pub async fn cleanup_sweep(core: &PipelineCore) -> Result<usize, TaskError> {
    let older_than = Utc::now() - core.config.cleanup_horizon();
    let jobs = core
        .metadata
        .list_cleanup_candidates(older_than, core.config.monitoring_batch_size)
        .await?;

    for job in &jobs {
        core.cache.purge(job.job_id).await?;
    }
    Ok(jobs.len())
}

/// Sweep 4: proves the scheduler is alive; absence is the alert signal,
/// not the log line itself.
pub fn health_beat() {
    tracing::info!("monitor heartbeat");
}

/// Drives all four sweeps on their configured cadences until `shutdown`
/// fires. The stuck-job and auto-retry sweeps share `check_interval`
/// (default 5 min); cleanup and the heartbeat run on their own fixed
/// cadences.
pub async fn run(core: Arc<PipelineCore>, mut shutdown: watch::Receiver<bool>) {
    if !core.config.monitoring_enabled {
        tracing::info!("monitoring disabled, monitor loop exiting immediately");
        return;
    }

    let mut check_tick = tokio::time::interval(core.config.check_interval());
    let mut cleanup_tick = tokio::time::interval(CLEANUP_INTERVAL);
    let mut health_tick = tokio::time::interval(HEALTH_BEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = check_tick.tick() => {
                if let Err(e) = stuck_job_sweep(&core).await {
                    tracing::error!(error = %e, "stuck-job sweep failed");
                }
                if core.config.monitoring_auto_retry_enabled {
                    if let Err(e) = auto_retry_sweep(&core).await {
                        tracing::error!(error = %e, "auto-retry sweep failed");
                    }
                }
            }
            _ = cleanup_tick.tick() => {
                if let Err(e) = cleanup_sweep(&core).await {
                    tracing::error!(error = %e, "cleanup sweep failed");
                }
            }
            _ = health_tick.tick() => {
                health_beat();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::collaborators::{FakeDocumentConverter, FakePageExtractor, FakeTranscriber};
    use crate::config::PipelineConfig;
    use crate::model::{Job, JobType, Page, SourceType};
    use crate::queue::Queue;
    use crate::search::InMemoryResultIndex;
    use crate::store::{InMemoryMetadataStore, InMemoryStatusCache};
    use uuid::Uuid;

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
    async fn stuck_job_sweep_fails_long_processing_jobs() {
        let core = build_core();
        let old_start = Utc::now() - chrono::Duration::minutes(60);
        let mut job = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("c".to_string()), old_start);
        job.status = Status::Processing;
        job.started_at = Some(old_start);
        let job = core.metadata.create_job(job).await.unwrap();
        core.cache
            .put_status(
                job.job_id,
                crate::store::cache::StatusRecord {
                    job_type: JobType::Main,
                    status: Status::Processing,
                    progress: 50,
                    name: None,
                    page_number: None,
                    parent_job_id: None,
                    started_at: Some(old_start),
                    completed_at: None,
                    error: None,
                },
            )
            .await
            .unwrap();

        let outcome = stuck_job_sweep(&core).await.unwrap();
        assert_eq!(outcome.jobs_failed, 1);

        let reloaded = core.metadata.find_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, Status::Failed);
        let record = core.cache.get_status(job.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, Status::Failed);
    }

    #[tokio::test]
    async fn auto_retry_sweep_skips_pages_whose_upload_is_gone() {
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

        let outcome = auto_retry_sweep(&core).await.unwrap();
        assert_eq!(outcome.retried, 0);
        assert_eq!(outcome.skipped_missing_upload, 1);

        let reloaded = core.metadata.find_page(page.page_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, Status::Pending);
        assert_eq!(reloaded.retry_count, 2);
        assert_ne!(reloaded.page_job_id, original_page_job_id);
    }

    #[tokio::test]
    async fn auto_retry_sweep_resets_page_when_upload_exists() {
        let core = build_core();
        let now = Utc::now();
        let mut main = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("c".to_string()), now);
        main.upload_object_key = Some("uploads/main/source.pdf".to_string());
        let main = core.metadata.create_job(main).await.unwrap();
        core.blobs.store("uploads/main/source.pdf", b"pdf bytes").await.unwrap();

        let page_job = Job::new_child(JobType::Page, &main, Some(1), now);
        let original_page_job_id = page_job.job_id;
        let mut page = Page::new(main.job_id, 1, original_page_job_id, "pages/x/page_0001.pdf", now);
        page.status = Status::Failed;
        page.retry_count = 1;
        let page = core.metadata.create_page(page).await.unwrap();

        let outcome = auto_retry_sweep(&core).await.unwrap();
        assert_eq!(outcome.retried, 1);

        let reloaded = core.metadata.find_page(page.page_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, Status::Pending);
        assert_eq!(reloaded.retry_count, 2);
        assert_ne!(reloaded.page_job_id, original_page_job_id);
    }

    #[tokio::test]
    async fn cleanup_sweep_purges_cache_but_keeps_metadata() {
        let core = build_core();
        let old_completed = Utc::now() - chrono::Duration::days(10);
        let mut job = Job::new_main("user-1", SourceType::File, None, None, None, None, Some("c".to_string()), old_completed);
        job.status = Status::Completed;
        job.completed_at = Some(old_completed);
        let job = core.metadata.create_job(job).await.unwrap();
        core.cache
            .put_status(
                job.job_id,
                crate::store::cache::StatusRecord {
                    job_type: JobType::Main,
                    status: Status::Completed,
                    progress: 100,
                    name: None,
                    page_number: None,
                    parent_job_id: None,
                    started_at: None,
                    completed_at: Some(old_completed),
                    error: None,
                },
            )
            .await
            .unwrap();

        let purged = cleanup_sweep(&core).await.unwrap();
        assert_eq!(purged, 1);
        assert!(core.cache.get_status(job.job_id).await.unwrap().is_none());
        assert!(core.metadata.find_job(job.job_id).await.unwrap().is_some());
    }
}
