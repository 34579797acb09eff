//! Wiring for the orchestration core: one struct holding every
//! gateway and collaborator trait object, passed by `Arc` to every
//! task handler and query operation.

use std::sync::Arc;

use crate::blob::BlobStore;
use crate::collaborators::{DocumentConverter, PageExtractor, Transcriber};
use crate::config::PipelineConfig;
use crate::queue::Queue;
use crate::search::ResultIndex;
use crate::store::{MetadataGateway, StatusCache};

#[derive(Clone)]
pub struct PipelineCore {
    pub metadata: Arc<dyn MetadataGateway>,
    pub cache: Arc<dyn StatusCache>,
    pub blobs: Arc<dyn BlobStore>,
    pub search: Arc<dyn ResultIndex>,
    pub queue: Arc<dyn Queue>,
    pub converter: Arc<dyn DocumentConverter>,
    pub transcriber: Arc<dyn Transcriber>,
    pub page_extractor: Arc<dyn PageExtractor>,
    pub config: PipelineConfig,
}

impl PipelineCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<dyn MetadataGateway>,
        cache: Arc<dyn StatusCache>,
        blobs: Arc<dyn BlobStore>,
        search: Arc<dyn ResultIndex>,
        queue: Arc<dyn Queue>,
        converter: Arc<dyn DocumentConverter>,
        transcriber: Arc<dyn Transcriber>,
        page_extractor: Arc<dyn PageExtractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            metadata,
            cache,
            blobs,
            search,
            queue,
            converter,
            transcriber,
            page_extractor,
            config,
        }
    }

    pub fn scratch_dir(&self, main_id: uuid::Uuid) -> std::path::PathBuf {
        self.config.scratch_root.join(main_id.to_string())
    }

    pub async fn remove_scratch_dir(&self, main_id: uuid::Uuid) {
        let dir = self.scratch_dir(main_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(main_id = %main_id, error = %e, "failed to remove scratch directory");
            }
        }
    }
}

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "flac", "ogg", "aac"];

pub fn is_audio_extension(filename: &str) -> bool {
    filename
        .rsplit('.')
        .next()
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Progress banding for the MAIN job: 10 accepted, 20
/// downloaded, 20+floor(70*completed/total) during fan-out, 100 done.
pub fn fan_out_progress(completed: i32, total: i32) -> i32 {
    if total <= 0 {
        return 20;
    }
    20 + (70 * completed / total).min(70)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_extension_detection_is_case_insensitive() {
        assert!(is_audio_extension("voicemail.MP3"));
        assert!(!is_audio_extension("report.pdf"));
    }

    #[test]
    fn fan_out_progress_is_bounded() {
        assert_eq!(fan_out_progress(0, 10), 20);
        assert_eq!(fan_out_progress(5, 10), 55);
        assert_eq!(fan_out_progress(10, 10), 90);
    }
}
