//! Submission `options`: a closed set of keys. Unknown keys
//! are ignored with a warning rather than rejected, so that a caller
//! on a newer API version does not fail an older orchestration core.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoclingPreset {
    Fast,
    Balanced,
    Quality,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionOptions {
    pub docling_preset: Option<DoclingPreset>,
    pub language: Option<String>,
    pub include_timestamps: bool,
    pub include_word_timestamps: bool,
    pub transcriber_provider: Option<String>,
    pub is_audio: bool,
}

const KNOWN_KEYS: &[&str] = &[
    "docling_preset",
    "language",
    "include_timestamps",
    "include_word_timestamps",
    "transcriber_provider",
    "is_audio",
];

impl SubmissionOptions {
    /// Parse a raw `options` map, logging a warning for every key
    /// outside the closed set instead of rejecting the submission.
    pub fn from_map(raw: &HashMap<String, serde_json::Value>) -> Self {
        for key in raw.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                tracing::warn!(option = %key, "ignoring unknown submission option");
            }
        }

        let mut opts = SubmissionOptions::default();
        if let Some(v) = raw.get("docling_preset").and_then(|v| v.as_str()) {
            opts.docling_preset = match v {
                "fast" => Some(DoclingPreset::Fast),
                "balanced" => Some(DoclingPreset::Balanced),
                "quality" => Some(DoclingPreset::Quality),
                other => {
                    tracing::warn!(value = %other, "ignoring unrecognized docling_preset value");
                    None
                }
            };
        }
        opts.language = raw
            .get("language")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        opts.include_timestamps = raw
            .get("include_timestamps")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        opts.include_word_timestamps = raw
            .get("include_word_timestamps")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        opts.transcriber_provider = raw
            .get("transcriber_provider")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        opts.is_audio = raw
            .get("is_audio")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_are_ignored_not_rejected() {
        let mut raw = HashMap::new();
        raw.insert("is_audio".to_string(), json!(true));
        raw.insert("totally_made_up".to_string(), json!(42));

        let opts = SubmissionOptions::from_map(&raw);
        assert!(opts.is_audio);
    }

    #[test]
    fn parses_docling_preset() {
        let mut raw = HashMap::new();
        raw.insert("docling_preset".to_string(), json!("quality"));
        let opts = SubmissionOptions::from_map(&raw);
        assert_eq!(opts.docling_preset, Some(DoclingPreset::Quality));
    }
}
