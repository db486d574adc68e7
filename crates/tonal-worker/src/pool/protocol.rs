//! Newline-delimited JSON messages between the orchestrator and a worker
//! process. Requests go to the worker's stdin, responses come back on
//! its stdout, one JSON object per line.

use serde::{Deserialize, Serialize};

use tonal_models::TaskId;

/// Orchestrator to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Analyze { id: TaskId, path: String },
    Ping,
}

/// Worker to orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Sent once, after the analysis context has loaded.
    Ready { pid: u32, version: String },
    Done { id: TaskId, result: serde_json::Value },
    Failed { id: TaskId, error: String },
    Pong,
}

impl WorkerRequest {
    /// Encode as one protocol line, newline included.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl WorkerResponse {
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Whether this response answers `request`.
    pub fn answers(&self, request: &WorkerRequest) -> bool {
        match (request, self) {
            (WorkerRequest::Analyze { id, .. }, WorkerResponse::Done { id: got, .. })
            | (WorkerRequest::Analyze { id, .. }, WorkerResponse::Failed { id: got, .. }) => {
                id == got
            }
            (WorkerRequest::Ping, WorkerResponse::Pong) => true,
            _ => false,
        }
    }
}
