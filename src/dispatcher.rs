//! Dispatcher (MAIN task handler): download/classify, then
//! either convert inline, spawn a SPLIT, or run the audio branch.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob;
use crate::collaborators::{ConversionOptions, TranscriptionOptions};
use crate::core::{is_audio_extension, PipelineCore};
use crate::error::TaskError;
use crate::model::{Job, JobPatch, JobType, Status};
use crate::options::SubmissionOptions;
use crate::queue::TaskHandler;
use crate::store::cache::StatusRecord;
use crate::store::ChildRole;

pub const MAX_ATTEMPTS: i32 = 3;
const RETRY_BASE_SECONDS: u64 = 60;
const MIN_PAGES_TO_SPLIT: i32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainTaskArgs {
    pub main_id: Uuid,
    pub local_path: Option<String>,
    pub options: SubmissionOptions,
}

pub fn retry_delay_seconds(attempt: u32) -> u64 {
    RETRY_BASE_SECONDS * 2u64.saturating_pow(attempt)
}

pub struct MainTaskHandler {
    core: Arc<PipelineCore>,
}

impl MainTaskHandler {
    pub fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }

    pub async fn run(&self, args: MainTaskArgs) -> Result<(), TaskError> {
        let now = Utc::now();
        let main_id = args.main_id;

        let main = self
            .core
            .metadata
            .find_job(main_id)
            .await?
            .ok_or_else(|| TaskError::Terminal(format!("main job {main_id} not found")))?;

        self.mark_processing(&main, now).await?;

        let local_path = match &args.local_path {
            Some(p) => std::path::PathBuf::from(p),
            None => {
                return Err(TaskError::Transient(
                    "remote source fetch not materialized".to_string(),
                ))
            }
        };

        let filename = main.filename.clone().unwrap_or_else(|| "upload".to_string());
        let upload_key = if args.options.is_audio || is_audio_extension(&filename) {
            format!("audio/{main_id}/{filename}")
        } else {
            blob::upload_key(main_id, &filename)
        };

        if main.upload_object_key.is_none() {
            let bytes = tokio::fs::read(&local_path)
                .await
                .map_err(|e| TaskError::Transient(format!("reading local upload: {e}")))?;
            self.core
                .blobs
                .store(&upload_key, &bytes)
                .await
                .map_err(|e| TaskError::Transient(e.to_string()))?;

            let mut patch = JobPatch::new(Utc::now());
            patch.upload_object_key = Some(Some(upload_key.clone()));
            self.core.metadata.update_job(main_id, patch).await?;
        }

        self.set_progress(main_id, 20).await?;

        if args.options.is_audio || is_audio_extension(&filename) {
            return self.run_audio_branch(main_id, &local_path, &args.options).await;
        }

        let should_split = self
            .core
            .page_extractor
            .should_split(&local_path, MIN_PAGES_TO_SPLIT)
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;

        if should_split {
            self.spawn_split(main_id, &local_path, &args.options).await
        } else {
            self.run_single_unit(main_id, &local_path, &args.options).await
        }
    }

    async fn mark_processing(&self, main: &Job, now: chrono::DateTime<Utc>) -> Result<(), TaskError> {
        let mut patch = JobPatch::new(now);
        patch.status = Some(Status::Processing);
        patch.started_at = Some(now);
        self.core.metadata.update_job(main.job_id, patch).await?;

        self.core
            .cache
            .put_status(
                main.job_id,
                StatusRecord {
                    job_type: JobType::Main,
                    status: Status::Processing,
                    progress: 10,
                    name: main.filename.clone(),
                    page_number: None,
                    parent_job_id: None,
                    started_at: Some(now),
                    completed_at: None,
                    error: None,
                },
            )
            .await?;
        Ok(())
    }

    async fn set_progress(&self, main_id: Uuid, value: i32) -> Result<(), TaskError> {
        let mut patch = JobPatch::new(Utc::now());
        patch.progress_percent = Some(value);
        self.core.metadata.update_job(main_id, patch).await?;
        self.core.cache.update_progress(main_id, value).await?;
        Ok(())
    }

    async fn run_audio_branch(
        &self,
        main_id: Uuid,
        local_path: &std::path::Path,
        options: &SubmissionOptions,
    ) -> Result<(), TaskError> {
        let transcription_options = TranscriptionOptions {
            language: options.language.clone(),
            include_word_timestamps: options.include_word_timestamps,
        };

        let result = self
            .core
            .transcriber
            .transcribe(local_path, &transcription_options)
            .await?;
        let markdown = self
            .core
            .transcriber
            .format_as_markdown(&result, options.include_timestamps);

        self.finalize_main_result(main_id, &markdown, result.char_count).await
    }

    async fn run_single_unit(
        &self,
        main_id: Uuid,
        local_path: &std::path::Path,
        options: &SubmissionOptions,
    ) -> Result<(), TaskError> {
        let conversion_options = ConversionOptions {
            docling_preset: options
                .docling_preset
                .map(|p| format!("{p:?}").to_lowercase())
                .unwrap_or_else(|| self.core.config.docling_preset.clone()),
        };

        let result = self.core.converter.convert(local_path, &conversion_options).await?;
        let char_count = result.markdown.len() as i64;
        self.finalize_main_result(main_id, &result.markdown, char_count).await
    }

    async fn finalize_main_result(
        &self,
        main_id: Uuid,
        markdown: &str,
        char_count: i64,
    ) -> Result<(), TaskError> {
        let now = Utc::now();

        self.core
            .cache
            .set_result(main_id, serde_json::json!({ "markdown": markdown }))
            .await?;

        let job = self
            .core
            .metadata
            .find_job(main_id)
            .await?
            .ok_or_else(|| TaskError::Terminal(format!("main job {main_id} not found")))?;

        self.core
            .search
            .index(crate::search::SearchDocument {
                job_id: main_id,
                user_id: job.user_id.clone(),
                filename: job.filename.clone(),
                content: markdown.to_string(),
            })
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;

        let key = blob::result_key(main_id);
        if let Err(e) = self.core.blobs.store(&key, markdown.as_bytes()).await {
            tracing::warn!(main_id = %main_id, error = %e, "best-effort result blob write failed");
        }

        let mut patch = JobPatch::new(now);
        patch.status = Some(Status::Completed);
        patch.progress_percent = Some(100);
        patch.char_count = Some(Some(char_count));
        patch.has_result_stored = Some(true);
        patch.result_object_key = Some(Some(key));
        patch.completed_at = Some(now);
        self.core.metadata.update_job(main_id, patch).await?;

        self.core
            .cache
            .put_status(
                main_id,
                StatusRecord {
                    job_type: JobType::Main,
                    status: Status::Completed,
                    progress: 100,
                    name: job.filename.clone(),
                    page_number: None,
                    parent_job_id: None,
                    started_at: job.started_at,
                    completed_at: Some(now),
                    error: None,
                },
            )
            .await?;

        self.core.remove_scratch_dir(main_id).await;
        Ok(())
    }

    async fn spawn_split(
        &self,
        main_id: Uuid,
        local_path: &std::path::Path,
        options: &SubmissionOptions,
    ) -> Result<(), TaskError> {
        let main = self
            .core
            .metadata
            .find_job(main_id)
            .await?
            .ok_or_else(|| TaskError::Terminal(format!("main job {main_id} not found")))?;

        let split_id = crate::clock::new_id();
        let now = Utc::now();
        let mut split_job = Job::new_child(JobType::Split, &main, None, now);
        split_job.job_id = split_id;
        self.core.metadata.create_job(split_job).await?;

        self.core
            .cache
            .put_status(
                split_id,
                StatusRecord {
                    job_type: JobType::Split,
                    status: Status::Queued,
                    progress: 0,
                    name: main.filename.clone(),
                    page_number: None,
                    parent_job_id: Some(main_id),
                    started_at: None,
                    completed_at: None,
                    error: None,
                },
            )
            .await?;
        self.core.cache.add_child(main_id, ChildRole::Split, split_id).await?;

        let split_args = crate::splitter::SplitTaskArgs {
            split_id,
            parent_id: main_id,
            local_path: local_path.display().to_string(),
            options: options.clone(),
        };
        self.core
            .queue
            .enqueue(
                "split",
                serde_json::to_value(split_args).expect("SplitTaskArgs always serializes"),
                crate::splitter::MAX_ATTEMPTS,
            )
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;

        Ok(())
    }

    async fn fail_main(&self, main_id: Uuid, message: String) -> Result<(), TaskError> {
        let now = Utc::now();
        let mut patch = JobPatch::new(now);
        patch.status = Some(Status::Failed);
        patch.error_message = Some(Some(message));
        patch.completed_at = Some(now);
        self.core.metadata.update_job(main_id, patch).await?;
        self.core.remove_scratch_dir(main_id).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskHandler for MainTaskHandler {
    async fn handle(&self, arguments: serde_json::Value) -> Result<(), TaskError> {
        let args: MainTaskArgs = serde_json::from_value(arguments)
            .map_err(|e| TaskError::InvalidInput(format!("bad main task arguments: {e}")))?;
        let main_id = args.main_id;
        match self.run(args).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.fail_main(main_id, e.message()).await;
                Err(e)
            }
        }
    }

    fn backoff_seconds(&self, attempt: u32) -> u64 {
        retry_delay_seconds(attempt)
    }
}
