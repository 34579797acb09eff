//! Configuration surface, loaded from the environment via a typed
//! `from_env` constructor and `dotenvy::dotenv()` for local/dev runs.
//! Every sweep takes its threshold as an explicit argument rather than
//! reading a mutable global; `PipelineConfig` only supplies the
//! *defaults*.

use std::time::Duration;

/// All tunables named in plus the store/collaborator
/// endpoints needed to actually construct the gateways.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_file_size_mb: u64,
    pub conversion_timeout_seconds: u64,
    pub max_audio_file_size_mb: u64,

    pub monitoring_enabled: bool,
    pub monitoring_stuck_job_threshold_minutes: i64,
    pub monitoring_cleanup_days: i64,
    pub monitoring_auto_retry_enabled: bool,
    pub monitoring_max_retry_count: i32,
    pub monitoring_check_interval_minutes: u64,
    pub monitoring_batch_size: i64,

    pub docling_preset: String,

    pub database_url: String,
    pub redis_url: String,
    pub scratch_root: std::path::PathBuf,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub search_endpoint: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 100,
            conversion_timeout_seconds: 300,
            max_audio_file_size_mb: 500,
            monitoring_enabled: true,
            monitoring_stuck_job_threshold_minutes: 30,
            monitoring_cleanup_days: 7,
            monitoring_auto_retry_enabled: true,
            monitoring_max_retry_count: 3,
            monitoring_check_interval_minutes: 5,
            monitoring_batch_size: 100,
            docling_preset: "balanced".to_string(),
            database_url: "postgresql://localhost:5432/pipeline".to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            scratch_root: std::path::PathBuf::from("/tmp/pipeline-scratch"),
            s3_endpoint: None,
            s3_region: "us-east-1".to_string(),
            search_endpoint: None,
        }
    }
}

impl PipelineConfig {
    /// Load `.env` (if present) then overlay every `PIPELINE_*` /
    /// well-known environment variable on top of the defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            cfg.redis_url = v;
        }
        if let Ok(v) = std::env::var("PIPELINE_SCRATCH_ROOT") {
            cfg.scratch_root = std::path::PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("S3_ENDPOINT") {
            cfg.s3_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("S3_REGION") {
            cfg.s3_region = v;
        }
        if let Ok(v) = std::env::var("SEARCH_ENDPOINT") {
            cfg.search_endpoint = Some(v);
        }

        macro_rules! env_num {
            ($field:expr, $key:literal) => {
                if let Ok(v) = std::env::var($key) {
                    if let Ok(parsed) = v.parse() {
                        $field = parsed;
                    }
                }
            };
        }

        env_num!(cfg.max_file_size_mb, "MAX_FILE_SIZE_MB");
        env_num!(cfg.conversion_timeout_seconds, "CONVERSION_TIMEOUT_SECONDS");
        env_num!(cfg.max_audio_file_size_mb, "MAX_AUDIO_FILE_SIZE_MB");
        env_num!(
            cfg.monitoring_stuck_job_threshold_minutes,
            "MONITORING_STUCK_JOB_THRESHOLD_MINUTES"
        );
        env_num!(cfg.monitoring_cleanup_days, "MONITORING_CLEANUP_DAYS");
        env_num!(
            cfg.monitoring_max_retry_count,
            "MONITORING_MAX_RETRY_COUNT"
        );
        env_num!(
            cfg.monitoring_check_interval_minutes,
            "MONITORING_CHECK_INTERVAL_MINUTES"
        );
        env_num!(cfg.monitoring_batch_size, "MONITORING_BATCH_SIZE");

        if let Ok(v) = std::env::var("MONITORING_ENABLED") {
            cfg.monitoring_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MONITORING_AUTO_RETRY_ENABLED") {
            cfg.monitoring_auto_retry_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DOCLING_PRESET") {
            cfg.docling_preset = v;
        }

        cfg
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.monitoring_stuck_job_threshold_minutes)
    }

    pub fn cleanup_horizon(&self) -> chrono::Duration {
        chrono::Duration::days(self.monitoring_cleanup_days)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_check_interval_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_monitoring_thresholds() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.monitoring_stuck_job_threshold_minutes, 30);
        assert_eq!(cfg.monitoring_cleanup_days, 7);
        assert_eq!(cfg.monitoring_max_retry_count, 3);
        assert_eq!(cfg.monitoring_check_interval_minutes, 5);
        assert_eq!(cfg.monitoring_batch_size, 100);
    }
}
