//! In-process queue and control channel.
//!
//! Same contracts as the Redis implementations, backed by shared memory.
//! Each type hands out a cloneable handle so a test (or an embedding
//! process) can feed work and commands while the orchestrator owns the
//! consuming side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use tonal_models::{ControlMessage, QueuedTask};

use crate::control::ControlChannel;
use crate::error::QueueResult;
use crate::queue::{decode_envelope, TaskQueue};

/// FIFO of raw JSON envelopes, decoded the same way as Redis entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskQueue {
    entries: Arc<Mutex<VecDeque<String>>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task envelope.
    pub fn push(&self, task: &QueuedTask) {
        let payload = serde_json::to_string(task).unwrap_or_default();
        self.push_raw(payload);
    }

    /// Append a raw payload, as an external producer would.
    pub fn push_raw(&self, payload: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(payload.into());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn pop_batch(&mut self, max: usize) -> QueueResult<Vec<QueuedTask>> {
        let popped: Vec<String> = match self.entries.lock() {
            Ok(mut entries) => {
                let n = max.min(entries.len());
                entries.drain(..n).collect()
            }
            Err(_) => Vec::new(),
        };

        Ok(popped.iter().filter_map(|p| decode_envelope(p)).collect())
    }
}

/// Control channel fed through a [`MemoryControlHandle`].
#[derive(Debug)]
pub struct MemoryControl {
    rx: mpsc::UnboundedReceiver<ControlMessage>,
    closes: Arc<AtomicUsize>,
}

/// Publishing side of a [`MemoryControl`].
#[derive(Debug, Clone)]
pub struct MemoryControlHandle {
    tx: mpsc::UnboundedSender<ControlMessage>,
    closes: Arc<AtomicUsize>,
}

impl MemoryControl {
    pub fn new() -> (Self, MemoryControlHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                rx,
                closes: Arc::clone(&closes),
            },
            MemoryControlHandle { tx, closes },
        )
    }
}

impl MemoryControlHandle {
    /// Publish a raw payload; decoded exactly like a Redis message.
    pub fn publish_raw(&self, payload: &str) -> bool {
        self.tx.send(ControlMessage::parse(payload)).is_ok()
    }

    pub fn publish(&self, message: ControlMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Number of times the consuming side has been closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ControlChannel for MemoryControl {
    fn poll(&mut self) -> Option<ControlMessage> {
        self.rx.try_recv().ok()
    }

    fn close(&mut self) {
        self.rx.close();
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
