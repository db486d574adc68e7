//! Feature-extraction capability run inside worker processes.
//!
//! The orchestrator never calls an [`Analyzer`] directly; it only sees
//! results coming back over the worker protocol.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("File not found")]
    NotFound,

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Analysis failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A long-lived analysis context, built once per worker process.
pub trait Analyzer: Sized {
    /// Load the heavy context. Failure terminates the worker process.
    fn init(media_root: &Path) -> Result<Self, AnalyzerError>;

    /// Version string stamped onto every stored result.
    fn version(&self) -> &str;

    /// Analyze one resolved media file.
    fn analyze(&mut self, path: &Path) -> Result<serde_json::Value, AnalyzerError>;
}

/// Resolve a task path against the media root.
///
/// Backslash separators from other platforms are normalized first.
/// Absolute paths are kept as given.
pub fn resolve_media_path(root: &Path, raw: &str) -> PathBuf {
    let normalized = raw.replace('\\', "/");
    root.join(normalized)
}

const PROBE_VERSION: &str = "probe-1";
const READ_CHUNK: usize = 64 * 1024;

/// Analyzer that fingerprints files without decoding audio.
pub struct ProbeAnalyzer {
    buffer: Vec<u8>,
}

impl Analyzer for ProbeAnalyzer {
    fn init(media_root: &Path) -> Result<Self, AnalyzerError> {
        if !media_root.is_dir() {
            return Err(AnalyzerError::Init(format!(
                "media root {} is not a directory",
                media_root.display()
            )));
        }
        Ok(Self {
            buffer: vec![0u8; READ_CHUNK],
        })
    }

    fn version(&self) -> &str {
        PROBE_VERSION
    }

    fn analyze(&mut self, path: &Path) -> Result<serde_json::Value, AnalyzerError> {
        if !path.is_file() {
            return Err(AnalyzerError::NotFound);
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        loop {
            let n = reader.read(&mut self.buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&self.buffer[..n]);
            size += n as u64;
        }

        if size == 0 {
            return Err(AnalyzerError::Failed("empty file".to_string()));
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        Ok(json!({
            "analysisMode": "probe",
            "sizeBytes": size,
            "extension": extension,
            "sha256": format!("{:x}", hasher.finalize()),
        }))
    }
}
