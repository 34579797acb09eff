//! Fan-in aggregator: "are all of this parent's page
//! children terminal?", plus the exactly-once MERGE enqueue that
//! follows from a positive answer.
//!
//! The race is inherent: N page tasks can all observe "all terminal"
//! concurrently (the last-finishing one is indistinguishable from a
//! straggler to every other page task). [`StatusCache::set_child_if_absent`]
//! is the only primitive that needs to be atomic for this to be
//! exactly-once; everything else here is plain reads.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::core::PipelineCore;
use crate::error::TaskError;
use crate::model::JobType;
use crate::store::cache::StatusRecord;
use crate::store::ChildRole;

/// Runs the fan-in predicate for `parent_id` and, if it holds,
/// allocates and enqueues the single MERGE task. Safe to call from
/// every racing PAGE task; only the winner of `set_child_if_absent`
/// actually enqueues.
pub async fn check_and_trigger_merge(core: &Arc<PipelineCore>, parent_id: Uuid) -> Result<(), TaskError> {
    if !core.cache.all_page_children_terminal(parent_id).await? {
        return Ok(());
    }

    let merge_id = crate::clock::new_id();
    let won = core
        .cache
        .set_child_if_absent(parent_id, ChildRole::Merge, merge_id)
        .await?;
    if !won {
        return Ok(());
    }

    let main = core
        .metadata
        .find_job(parent_id)
        .await?
        .ok_or_else(|| TaskError::Terminal(format!("main job {parent_id} not found")))?;

    let mut merge_job = crate::model::Job::new_child(JobType::Merge, &main, None, Utc::now());
    merge_job.job_id = merge_id;
    core.metadata.create_job(merge_job).await?;

    core.cache
        .put_status(
            merge_id,
            StatusRecord {
                job_type: JobType::Merge,
                status: crate::model::Status::Queued,
                progress: 0,
                name: None,
                page_number: None,
                parent_job_id: Some(parent_id),
                started_at: None,
                completed_at: None,
                error: None,
            },
        )
        .await?;

    let args = crate::merger::MergeTaskArgs { merge_id, parent_id };
    core.queue
        .enqueue(
            "merge",
            serde_json::to_value(args).expect("MergeTaskArgs always serializes"),
            crate::merger::MAX_ATTEMPTS,
        )
        .await
        .map_err(|e| TaskError::Transient(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::collaborators::{FakeDocumentConverter, FakePageExtractor, FakeTranscriber};
    use crate::config::PipelineConfig;
    use crate::model::{Job, SourceType};
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
    async fn merge_enqueues_exactly_once_under_concurrent_calls() {
        let core = build_core();
        let now = Utc::now();
        let main = Job::new_main(
            "user-1",
            SourceType::File,
            None,
            None,
            None,
            None,
            Some("chk".to_string()),
            now,
        );
        let main = core.metadata.create_job(main).await.unwrap();

        let page_a = Uuid::new_v4();
        let page_b = Uuid::new_v4();
        for page in [page_a, page_b] {
            core.cache.add_child(main.job_id, ChildRole::Page, page).await.unwrap();
            core.cache
                .put_status(
                    page,
                    StatusRecord {
                        job_type: JobType::Page,
                        status: crate::model::Status::Completed,
                        progress: 100,
                        name: None,
                        page_number: Some(1),
                        parent_job_id: Some(main.job_id),
                        started_at: None,
                        completed_at: Some(now),
                        error: None,
                    },
                )
                .await
                .unwrap();
        }

        let results = futures::future::join_all(
            (0..5).map(|_| check_and_trigger_merge(&core, main.job_id)),
        )
        .await;
        for r in results {
            r.unwrap();
        }

        let children = core.metadata.find_children(main.job_id, None).await.unwrap();
        let merges: Vec<_> = children.into_iter().filter(|j| j.job_type == JobType::Merge).collect();
        assert_eq!(merges.len(), 1);
    }
}
