//! End-to-end scenarios driving the full MAIN -> SPLIT -> PAGE x N ->
//! MERGE chain through the public task handlers and a queue double
//! that records every enqueued task so the test can drain it itself.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use pipeline_core::blob::InMemoryBlobStore;
use pipeline_core::collaborators::{FakeDocumentConverter, FakePageExtractor, FakeTranscriber};
use pipeline_core::config::PipelineConfig;
use pipeline_core::core::PipelineCore;
use pipeline_core::dispatcher::MainTaskHandler;
use pipeline_core::error::QueueError;
use pipeline_core::merger::MergeTaskHandler;
use pipeline_core::model::{JobType, Status};
use pipeline_core::page_task::PageTaskHandler;
use pipeline_core::queue::{Queue, TaskHandler};
use pipeline_core::search::InMemoryResultIndex;
use pipeline_core::splitter::SplitTaskHandler;
use pipeline_core::store::{InMemoryMetadataStore, InMemoryStatusCache};
use pipeline_core::submission::{self, SourceDescriptor};

struct RecordingQueue {
    tasks: Mutex<VecDeque<(String, serde_json::Value)>>,
}

impl RecordingQueue {
    fn new() -> Self {
        Self { tasks: Mutex::new(VecDeque::new()) }
    }

    async fn pop(&self) -> Option<(String, serde_json::Value)> {
        self.tasks.lock().await.pop_front()
    }
}

#[async_trait::async_trait]
impl Queue for RecordingQueue {
    async fn enqueue(&self, task_name: &str, arguments: serde_json::Value, _max_attempts: i32) -> Result<Uuid, QueueError> {
        self.tasks.lock().await.push_back((task_name.to_string(), arguments));
        Ok(Uuid::new_v4())
    }

    async fn enqueue_periodic(&self, _task_name: &str, _cron: &str) -> Result<(), QueueError> {
        Ok(())
    }
}

fn build_core() -> (Arc<PipelineCore>, Arc<RecordingQueue>) {
    let queue = Arc::new(RecordingQueue::new());
    let mut config = PipelineConfig::default();
    config.scratch_root = std::env::temp_dir().join(format!("pipeline-core-e2e-{}", Uuid::new_v4()));
    let core = Arc::new(PipelineCore::new(
        Arc::new(InMemoryMetadataStore::new()),
        Arc::new(InMemoryStatusCache::new()),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(InMemoryResultIndex::new()),
        Arc::clone(&queue) as Arc<dyn Queue>,
        Arc::new(FakeDocumentConverter),
        Arc::new(FakeTranscriber),
        Arc::new(FakePageExtractor::default()),
        config,
    ));
    (core, queue)
}

/// Drains whatever `queue` collected, dispatching each task to its
/// handler, until the queue runs dry. Handlers enqueue follow-on tasks
/// (SPLIT enqueues PAGE x N, the last PAGE enqueues MERGE) so draining
/// is a fixed-point loop, not a single pass.
async fn drain(core: &Arc<PipelineCore>, queue: &RecordingQueue) {
    let main_handler = MainTaskHandler::new(Arc::clone(core));
    let split_handler = SplitTaskHandler::new(Arc::clone(core));
    let page_handler = PageTaskHandler::new(Arc::clone(core));
    let merge_handler = MergeTaskHandler::new(Arc::clone(core));

    while let Some((name, args)) = queue.pop().await {
        let result = match name.as_str() {
            "main" => main_handler.handle(args).await,
            "split" => split_handler.handle(args).await,
            "page" => page_handler.handle(args).await,
            "merge" => merge_handler.handle(args).await,
            other => panic!("unexpected task type in drain: {other}"),
        };
        result.unwrap();
    }
}

#[tokio::test]
async fn single_page_document_completes_without_fan_out() {
    let (core, queue) = build_core();
    let outcome = submission::submit(
        &core,
        "user-1",
        SourceDescriptor::File { filename: "note.pdf".to_string(), mime_type: None, bytes: b"short note".to_vec() },
        Default::default(),
    )
    .await
    .unwrap();

    drain(&core, &queue).await;

    let job = core.metadata.find_job(outcome.main_id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.progress_percent, 100);
    assert!(job.total_pages.is_none());

    let pages = core.metadata.find_pages(outcome.main_id).await.unwrap();
    assert!(pages.is_empty());

    let children = core.metadata.find_children(outcome.main_id, None).await.unwrap();
    assert!(children.is_empty());
}

#[tokio::test]
async fn five_page_document_fans_out_and_merges() {
    let (core, queue) = build_core();
    let bytes = vec![0u8; 320]; // 320 / 64 = 5 pages under the fake extractor
    let outcome = submission::submit(
        &core,
        "user-1",
        SourceDescriptor::File { filename: "report.pdf".to_string(), mime_type: None, bytes },
        Default::default(),
    )
    .await
    .unwrap();

    drain(&core, &queue).await;

    let job = core.metadata.find_job(outcome.main_id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.total_pages, Some(5));
    assert_eq!(job.pages_completed, 5);
    assert_eq!(job.pages_failed, 0);

    let pages = core.metadata.find_pages(outcome.main_id).await.unwrap();
    assert_eq!(pages.len(), 5);
    assert!(pages.iter().all(|p| p.status == Status::Completed));

    let children = core.metadata.find_children(outcome.main_id, None).await.unwrap();
    let split_count = children.iter().filter(|j| j.job_type == JobType::Split).count();
    let merge_count = children.iter().filter(|j| j.job_type == JobType::Merge).count();
    assert_eq!(split_count, 1);
    assert_eq!(merge_count, 1);

    let result = pipeline_core::query::get_result(&core, outcome.main_id).await.unwrap();
    let separators = result.matches("\n\n---\n\n").count();
    assert_eq!(separators, 4);
}

#[tokio::test]
async fn duplicate_submission_returns_the_first_main_id() {
    let (core, queue) = build_core();
    let bytes = b"identical contents".to_vec();

    let first = submission::submit(
        &core,
        "user-1",
        SourceDescriptor::File { filename: "note.pdf".to_string(), mime_type: None, bytes: bytes.clone() },
        Default::default(),
    )
    .await
    .unwrap();
    drain(&core, &queue).await;

    let second = submission::submit(
        &core,
        "user-1",
        SourceDescriptor::File { filename: "note2.pdf".to_string(), mime_type: None, bytes },
        Default::default(),
    )
    .await
    .unwrap();

    assert_eq!(second.main_id, first.main_id);
    assert!(second.deduplicated);

    let jobs = pipeline_core::query::list_user_jobs(&core, "user-1", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
}
