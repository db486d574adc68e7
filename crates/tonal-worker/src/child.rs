//! Worker-process side of the pool protocol.
//!
//! Runs synchronously: one request at a time from stdin, one response per
//! request on stdout. Logs go to stderr.

use std::io::{BufRead, Write};
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::analyzer::{resolve_media_path, Analyzer};
use crate::error::WorkerResult;
use crate::pool::protocol::{WorkerRequest, WorkerResponse};

/// Serve requests until `input` reaches EOF.
///
/// The analyzer is built once up front. If that fails the error is
/// returned before `ready` is ever written, and the caller exits non-zero.
pub fn serve<A, R, W>(media_root: &Path, input: R, mut output: W) -> WorkerResult<()>
where
    A: Analyzer,
    R: BufRead,
    W: Write,
{
    let mut analyzer = A::init(media_root).map_err(|e| {
        error!("Analyzer initialization failed: {}", e);
        e
    })?;

    let ready = WorkerResponse::Ready {
        pid: std::process::id(),
        version: analyzer.version().to_string(),
    };
    send(&mut output, &ready)?;
    info!("Worker {} ready", std::process::id());

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed request: {}", e);
                continue;
            }
        };

        let response = match request {
            WorkerRequest::Ping => WorkerResponse::Pong,
            WorkerRequest::Analyze { id, path } => {
                let full_path = resolve_media_path(media_root, &path);
                debug!("Analyzing {} ({})", id, full_path.display());
                match analyzer.analyze(&full_path) {
                    Ok(result) => WorkerResponse::Done { id, result },
                    Err(e) => {
                        warn!("Analysis failed for {}: {}", path, e);
                        WorkerResponse::Failed {
                            id,
                            error: e.to_string(),
                        }
                    }
                }
            }
        };
        send(&mut output, &response)?;
    }

    info!("Worker {} input closed, exiting", std::process::id());
    Ok(())
}

/// Serve on the process's own stdin and stdout.
pub fn run_worker<A: Analyzer>(media_root: &Path) -> WorkerResult<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve::<A, _, _>(media_root, stdin.lock(), stdout.lock())
}

fn send<W: Write>(output: &mut W, response: &WorkerResponse) -> WorkerResult<()> {
    output.write_all(response.to_line()?.as_bytes())?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerError;
    use std::io::Cursor;

    struct EchoAnalyzer;

    impl Analyzer for EchoAnalyzer {
        fn init(_: &Path) -> Result<Self, AnalyzerError> {
            Ok(Self)
        }

        fn version(&self) -> &str {
            "echo-1"
        }

        fn analyze(&mut self, path: &Path) -> Result<serde_json::Value, AnalyzerError> {
            if path.ends_with("bad.mp3") {
                return Err(AnalyzerError::Failed("corrupt frame".to_string()));
            }
            Ok(serde_json::json!({ "path": path.to_string_lossy() }))
        }
    }

    struct BrokenAnalyzer;

    impl Analyzer for BrokenAnalyzer {
        fn init(_: &Path) -> Result<Self, AnalyzerError> {
            Err(AnalyzerError::Init("model missing".to_string()))
        }

        fn version(&self) -> &str {
            "never"
        }

        fn analyze(&mut self, _: &Path) -> Result<serde_json::Value, AnalyzerError> {
            unreachable!()
        }
    }

    fn responses(output: &[u8]) -> Vec<WorkerResponse> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_serve_answers_each_request() {
        let input = concat!(
            "{\"type\":\"ping\"}\n",
            "not json\n",
            "{\"type\":\"analyze\",\"id\":\"1\",\"path\":\"A\\\\good.mp3\"}\n",
            "{\"type\":\"analyze\",\"id\":\"2\",\"path\":\"bad.mp3\"}\n",
        );
        let mut output = Vec::new();

        serve::<EchoAnalyzer, _, _>(Path::new("/music"), Cursor::new(input), &mut output).unwrap();

        let got = responses(&output);
        assert_eq!(got.len(), 4);
        assert!(matches!(&got[0], WorkerResponse::Ready { version, .. } if version == "echo-1"));
        assert_eq!(got[1], WorkerResponse::Pong);
        assert_eq!(
            got[2],
            WorkerResponse::Done {
                id: "1".into(),
                result: serde_json::json!({ "path": "/music/A/good.mp3" }),
            }
        );
        assert_eq!(
            got[3],
            WorkerResponse::Failed {
                id: "2".into(),
                error: "Analysis failed: corrupt frame".to_string(),
            }
        );
    }

    #[test]
    fn test_init_failure_never_reports_ready() {
        let mut output = Vec::new();
        let result =
            serve::<BrokenAnalyzer, _, _>(Path::new("/music"), Cursor::new(""), &mut output);

        assert!(result.is_err());
        assert!(output.is_empty());
    }
}
