//! Submission entry point: validates the source
//! synchronously, applies the dedup gate, materializes the payload to
//! scratch disk, and enqueues the MAIN task. No job row is created and
//! nothing is enqueued when validation fails.

use chrono::Utc;
use uuid::Uuid;

use crate::core::{is_audio_extension, PipelineCore};
use crate::dedup;
use crate::dispatcher::{self, MainTaskArgs};
use crate::model::{Job, JobType, SourceType, Status};
use crate::options::SubmissionOptions;
use crate::store::cache::StatusRecord;

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("no file content or source url provided")]
    EmptySource,

    #[error("file size {actual_mb}MB exceeds the {limit_mb}MB limit")]
    TooLarge { actual_mb: u64, limit_mb: u64 },

    #[error("invalid source url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Store(#[from] crate::error::StoreError),

    #[error(transparent)]
    Cache(#[from] crate::error::CacheError),

    #[error(transparent)]
    Queue(#[from] crate::error::QueueError),

    #[error("writing upload to scratch disk: {0}")]
    Scratch(#[from] std::io::Error),
}

/// What the caller hands in. A `File` carries its bytes directly (the
/// checksum is computed here); `Remote` only carries a URL, fetched
/// later by the MAIN task, so it cannot take part in the dedup gate.
pub enum SourceDescriptor {
    File {
        filename: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
    Remote {
        source_type: SourceType,
        url: String,
    },
}

#[derive(Debug)]
pub struct SubmissionOutcome {
    pub main_id: Uuid,
    pub initial_status: Status,
    /// `true` when an existing MAIN for this `(user_id, file_checksum)`
    /// was returned instead of creating a new job.
    pub deduplicated: bool,
}

pub async fn submit(
    core: &PipelineCore,
    user_id: &str,
    source: SourceDescriptor,
    options: SubmissionOptions,
) -> Result<SubmissionOutcome, SubmissionError> {
    let now = Utc::now();

    match source {
        SourceDescriptor::File { filename, mime_type, bytes } => {
            if bytes.is_empty() {
                return Err(SubmissionError::EmptySource);
            }

            let limit_mb = if options.is_audio || is_audio_extension(&filename) {
                core.config.max_audio_file_size_mb
            } else {
                core.config.max_file_size_mb
            };
            let size_mb = (bytes.len() as u64) / (1024 * 1024);
            if size_mb > limit_mb {
                return Err(SubmissionError::TooLarge { actual_mb: size_mb, limit_mb });
            }

            let checksum = dedup::sha256_hex(&bytes);
            if let Some(existing) =
                dedup::find_existing(core.metadata.as_ref(), user_id, &checksum).await?
            {
                return Ok(SubmissionOutcome {
                    main_id: existing.job_id,
                    initial_status: existing.status,
                    deduplicated: true,
                });
            }

            let source_type = if options.is_audio { SourceType::Audio } else { SourceType::File };
            let job = Job::new_main(
                user_id,
                source_type,
                None,
                Some(filename.clone()),
                mime_type,
                Some(bytes.len() as i64),
                Some(checksum),
                now,
            );
            let main_id = job.job_id;
            core.metadata.create_job(job).await?;

            let scratch = core.scratch_dir(main_id);
            tokio::fs::create_dir_all(&scratch).await?;
            let local_path = scratch.join(&filename);
            tokio::fs::write(&local_path, &bytes).await?;

            enqueue_main(
                core,
                user_id,
                main_id,
                Some(filename),
                Some(local_path.display().to_string()),
                options,
            )
            .await?;

            Ok(SubmissionOutcome { main_id, initial_status: Status::Queued, deduplicated: false })
        }

        SourceDescriptor::Remote { source_type, url } => {
            if url.trim().is_empty() {
                return Err(SubmissionError::EmptySource);
            }
            url::Url::parse(&url).map_err(|e| SubmissionError::InvalidUrl(e.to_string()))?;

            // URL and cloud-drive sources don't carry a checksum at
            // submission time, so they skip the dedup gate.
            let job = Job::new_main(user_id, source_type, Some(url.clone()), None, None, None, None, now);
            let main_id = job.job_id;
            core.metadata.create_job(job).await?;

            // Remote fetch is out of scope here; the MAIN task is
            // enqueued with no local_path and will surface a transient
            // failure until a fetch collaborator is wired in.
            enqueue_main(core, user_id, main_id, None, None, options).await?;

            Ok(SubmissionOutcome { main_id, initial_status: Status::Queued, deduplicated: false })
        }
    }
}

async fn enqueue_main(
    core: &PipelineCore,
    user_id: &str,
    main_id: Uuid,
    filename: Option<String>,
    local_path: Option<String>,
    options: SubmissionOptions,
) -> Result<(), SubmissionError> {
    core.cache
        .put_status(
            main_id,
            StatusRecord {
                job_type: JobType::Main,
                status: Status::Queued,
                progress: 0,
                name: filename,
                page_number: None,
                parent_job_id: None,
                started_at: None,
                completed_at: None,
                error: None,
            },
        )
        .await?;
    core.cache.set_owner(main_id, user_id).await?;

    let args = MainTaskArgs { main_id, local_path, options };
    core.queue
        .enqueue("main", serde_json::to_value(args).expect("MainTaskArgs always serializes"), dispatcher::MAX_ATTEMPTS)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::collaborators::{FakeDocumentConverter, FakePageExtractor, FakeTranscriber};
    use crate::config::PipelineConfig;
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
        let mut config = PipelineConfig::default();
        config.scratch_root = std::env::temp_dir().join(format!("pipeline-core-test-{}", Uuid::new_v4()));
        PipelineCore::new(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryStatusCache::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryResultIndex::new()),
            Arc::new(NullQueue),
            Arc::new(FakeDocumentConverter),
            Arc::new(FakeTranscriber),
            Arc::new(FakePageExtractor::default()),
            config,
        )
    }

    #[tokio::test]
    async fn empty_file_is_rejected_before_any_job_is_created() {
        let core = build_core();
        let err = submit(
            &core,
            "user-1",
            SourceDescriptor::File { filename: "a.pdf".to_string(), mime_type: None, bytes: vec![] },
            SubmissionOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubmissionError::EmptySource));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let mut core = build_core();
        core.config.max_file_size_mb = 0;
        let err = submit(
            &core,
            "user-1",
            SourceDescriptor::File { filename: "a.pdf".to_string(), mime_type: None, bytes: vec![0u8; 2 * 1024 * 1024] },
            SubmissionOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubmissionError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn second_submission_of_identical_file_by_same_user_is_deduplicated() {
        let core = build_core();
        let bytes = b"same file contents".to_vec();

        let first = submit(
            &core,
            "user-1",
            SourceDescriptor::File { filename: "a.pdf".to_string(), mime_type: None, bytes: bytes.clone() },
            SubmissionOptions::default(),
        )
        .await
        .unwrap();
        assert!(!first.deduplicated);

        let second = submit(
            &core,
            "user-1",
            SourceDescriptor::File { filename: "a.pdf".to_string(), mime_type: None, bytes },
            SubmissionOptions::default(),
        )
        .await
        .unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.main_id, first.main_id);
    }

    #[tokio::test]
    async fn remote_url_source_skips_the_dedup_gate() {
        let core = build_core();
        let first = submit(
            &core,
            "user-1",
            SourceDescriptor::Remote { source_type: SourceType::Url, url: "https://example.com/a.pdf".to_string() },
            SubmissionOptions::default(),
        )
        .await
        .unwrap();
        let second = submit(
            &core,
            "user-1",
            SourceDescriptor::Remote { source_type: SourceType::Url, url: "https://example.com/a.pdf".to_string() },
            SubmissionOptions::default(),
        )
        .await
        .unwrap();
        assert!(!second.deduplicated);
        assert_ne!(first.main_id, second.main_id);
    }

    #[tokio::test]
    async fn blank_url_is_rejected() {
        let core = build_core();
        let err = submit(
            &core,
            "user-1",
            SourceDescriptor::Remote { source_type: SourceType::Url, url: "   ".to_string() },
            SubmissionOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubmissionError::EmptySource));
    }
}
