//! Failure ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity type recorded in the ledger for audio analysis failures.
pub const AUDIO_ENTITY_TYPE: &str = "audio";

/// Per-entity failure history, keyed by `(entity_type, entity_id)`.
///
/// Upserted on every failure. A fresh failure clears `resolved` and
/// `skipped` so an operator sees it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub error_message: String,
    pub last_failed_at: DateTime<Utc>,
    /// Never decreases across upserts
    pub retry_count: u32,
    pub metadata: serde_json::Value,
    pub resolved: bool,
    pub skipped: bool,
}

/// Metadata blob stored alongside a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureMetadata {
    pub file_path: String,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl FailureMetadata {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "filePath": self.file_path,
            "retryCount": self.retry_count,
            "maxRetries": self.max_retries,
        })
    }
}
