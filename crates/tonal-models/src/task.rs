//! Analysis task definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of characters of an error message persisted per task.
pub const MAX_ERROR_LEN: usize = 500;

/// Unique identifier for a task.
///
/// Opaque to the orchestrator; assigned by whoever creates the task row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be dispatched
    #[default]
    Pending,
    /// Claimed by the orchestrator and handed to a worker
    Processing,
    /// Analysis result persisted
    Completed,
    /// Last attempt failed (may be retried by the failed-retry sweep)
    Failed,
}

impl TaskStatus {
    /// Get string representation of the status, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Only tasks in `processing` may move to `completed` or `failed`.
    pub fn can_finish(&self) -> bool {
        matches!(self, TaskStatus::Processing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a stored status string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A task row as seen by the orchestrator.
///
/// Fields outside this set belong to the external schema and are never
/// touched here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Media path, relative to the configured media root
    pub path: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Set when the task is claimed for dispatch
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Opaque analysis payload written on success
    pub result: Option<serde_json::Value>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub analysis_version: Option<String>,
    /// Modification time of the media file; newest pending items go first
    pub file_modified: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: impl Into<TaskId>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            status: TaskStatus::Pending,
            retry_count: 0,
            started_at: None,
            last_error: None,
            result: None,
            analyzed_at: None,
            analysis_version: None,
            file_modified: None,
            updated_at: Utc::now(),
        }
    }

    /// Set the media file modification time.
    pub fn with_file_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.file_modified = Some(modified);
        self
    }

    /// Time the stale sweep measures age from: `started_at`, else `updated_at`.
    pub fn processing_since(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.updated_at)
    }

    /// Envelope used for dispatch.
    pub fn to_queued(&self) -> QueuedTask {
        QueuedTask::new(self.id.clone(), self.path.clone())
    }
}

/// Unit of dispatch: the `{id, path}` pair carried by the push queue and
/// handed to a worker.
///
/// Producers that predate the current field names send `trackId` and
/// `filePath`; both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuedTask {
    #[serde(alias = "trackId")]
    pub id: TaskId,
    #[serde(alias = "filePath", default)]
    pub path: String,
}

impl QueuedTask {
    pub fn new(id: impl Into<TaskId>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Truncate an error message to [`MAX_ERROR_LEN`] characters.
///
/// Cuts on a character boundary so multi-byte paths in messages stay valid.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("stale".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_only_processing_can_finish() {
        assert!(TaskStatus::Processing.can_finish());
        assert!(!TaskStatus::Pending.can_finish());
        assert!(!TaskStatus::Completed.can_finish());
        assert!(!TaskStatus::Failed.can_finish());
    }

    #[test]
    fn test_envelope_accepts_legacy_field_names() {
        let current: QueuedTask =
            serde_json::from_str(r#"{"id":"t1","path":"a/b.flac"}"#).unwrap();
        let legacy: QueuedTask =
            serde_json::from_str(r#"{"trackId":"t1","filePath":"a/b.flac"}"#).unwrap();

        assert_eq!(current, legacy);
        assert_eq!(current.id.as_str(), "t1");
    }

    #[test]
    fn test_envelope_without_id_is_rejected() {
        assert!(serde_json::from_str::<QueuedTask>(r#"{"path":"x.mp3"}"#).is_err());
    }

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let short = "decode failed";
        assert_eq!(truncate_error(short), short);

        let long = "é".repeat(MAX_ERROR_LEN + 20);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_processing_since_falls_back_to_updated_at() {
        let mut task = Task::new("t1", "song.mp3");
        assert_eq!(task.processing_since(), task.updated_at);

        let started = Utc::now();
        task.started_at = Some(started);
        assert_eq!(task.processing_since(), started);
    }
}
