//! Worker process launch and the per-process driver task.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::protocol::{WorkerRequest, WorkerResponse};
use super::{PoolConfig, PoolHealth, TaskOutcome};

/// Time a drained worker gets to exit after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Thread-count variables capped for native numeric libraries.
const THREAD_CAP_VARS: &[&str] = &[
    "OMP_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "MKL_NUM_THREADS",
    "NUMEXPR_MAX_THREADS",
    "TF_NUM_INTRAOP_THREADS",
];

/// Builder for the command that starts one worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-run the current executable in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Cap native thread pools so N workers do not oversubscribe the host.
    pub fn thread_caps(mut self, threads: usize) -> Self {
        for var in THREAD_CAP_VARS {
            self = self.env(*var, threads.to_string());
        }
        self.env("TF_NUM_INTEROP_THREADS", "1")
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

/// A request waiting for a worker, with the channel its reply goes to.
pub(crate) struct Job {
    pub request: WorkerRequest,
    pub reply: oneshot::Sender<WorkerReply>,
}

#[derive(Debug)]
pub(crate) enum WorkerReply {
    Outcome(TaskOutcome),
    Pong,
}

pub(crate) type JobReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Why a worker had to be given up.
enum WorkerLost {
    /// The process died or closed its pipes
    Exited(String),
    /// The process is alive but stuck past the hung-task limit
    Hung(String),
}

/// How reading a response ended.
enum ReadOutcome {
    Response(WorkerResponse),
    Closed(String),
}

/// Own one worker process for its whole life.
///
/// Pulls jobs from the shared receiver one at a time, so each worker runs
/// at most one request. Returns when the job channel closes (drain) or the
/// process dies; in the second case the pool is marked broken.
pub(crate) async fn run_driver(
    slot: usize,
    config: Arc<PoolConfig>,
    jobs: JobReceiver,
    health: PoolHealth,
) {
    let mut child = match config.command.spawn() {
        Ok(child) => child,
        Err(e) => {
            health.mark_broken(format!("worker {} failed to spawn: {}", slot, e));
            return;
        }
    };

    let (mut stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            health.mark_broken(format!("worker {} has no stdio pipes", slot));
            return;
        }
    };
    let mut lines = BufReader::new(stdout).lines();

    let version = match timeout(config.startup_timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) => match serde_json::from_str::<WorkerResponse>(&line) {
            Ok(WorkerResponse::Ready { pid, version }) => {
                info!("Worker {} ready (pid {}, analyzer {})", slot, pid, version);
                version
            }
            _ => {
                health.mark_broken(format!("worker {} sent {:?} before ready", slot, line));
                return;
            }
        },
        Ok(Ok(None)) | Ok(Err(_)) => {
            let status = exit_status(&mut child).await;
            health.mark_broken(format!("worker {} exited during init ({})", slot, status));
            return;
        }
        Err(_) => {
            health.mark_broken(format!(
                "worker {} not ready after {:?}",
                slot, config.startup_timeout
            ));
            return;
        }
    };

    loop {
        let job = tokio::select! {
            job = next_job(&jobs) => match job {
                Some(job) => job,
                None => break,
            },
            status = child.wait() => {
                let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
                health.mark_broken(format!("worker {} exited while idle ({})", slot, status));
                return;
            }
        };

        match run_job(slot, &config, &health, job, &version, &mut stdin, &mut lines).await {
            Ok(()) => {}
            Err(WorkerLost::Exited(reason)) => {
                let status = exit_status(&mut child).await;
                warn!("{} ({})", reason, status);
                return;
            }
            Err(WorkerLost::Hung(reason)) => {
                let _ = child.kill().await;
                health.mark_broken(reason);
                return;
            }
        }
    }

    drop(stdin);
    match timeout(EXIT_GRACE, child.wait()).await {
        Ok(_) => debug!("Worker {} exited", slot),
        Err(_) => {
            warn!("Worker {} did not exit after drain, killing", slot);
            let _ = child.kill().await;
        }
    }
}

async fn next_job(jobs: &JobReceiver) -> Option<Job> {
    jobs.lock().await.recv().await
}

/// Send one request and deliver its reply.
///
/// `Err` means this worker can no longer be used. A crash marks the pool
/// broken before the failed task is answered.
async fn run_job(
    slot: usize,
    config: &PoolConfig,
    health: &PoolHealth,
    job: Job,
    version: &str,
    stdin: &mut ChildStdin,
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> Result<(), WorkerLost> {
    let Job { request, reply } = job;

    // Abandoned at a batch deadline or pool break; nobody reads the reply.
    if reply.is_closed() {
        debug!("Worker {} skipping a job with no waiting caller", slot);
        return Ok(());
    }

    let line = match request.to_line() {
        Ok(line) => line,
        Err(e) => {
            let _ = reply.send(WorkerReply::Outcome(TaskOutcome::Failed(e.to_string())));
            return Ok(());
        }
    };

    if let Err(e) = write_line(stdin, &line).await {
        let reason = format!("worker {} stdin closed: {}", slot, e);
        health.mark_broken(reason.clone());
        let _ = reply.send(crash_reply(&reason));
        return Err(WorkerLost::Exited(reason));
    }

    match timeout(config.task_timeout, read_response(lines, &request)).await {
        Ok(ReadOutcome::Response(response)) => {
            let _ = reply.send(to_reply(response, version));
            Ok(())
        }
        Ok(ReadOutcome::Closed(detail)) => {
            let reason = format!("worker {} exited mid-task: {}", slot, detail);
            health.mark_broken(reason.clone());
            let _ = reply.send(crash_reply(&reason));
            Err(WorkerLost::Exited(reason))
        }
        Err(_) => {
            let _ = reply.send(WorkerReply::Outcome(TaskOutcome::TimedOut(
                config.task_timeout,
            )));
            warn!(
                "Worker {} exceeded {:?}, abandoning its task",
                slot, config.task_timeout
            );

            // The abandoned work keeps this worker busy until it answers.
            let remaining = config.hung_task_limit.saturating_sub(config.task_timeout);
            match timeout(remaining, read_response(lines, &request)).await {
                Ok(ReadOutcome::Response(_)) => {
                    debug!("Worker {} discarded a late response", slot);
                    Ok(())
                }
                Ok(ReadOutcome::Closed(detail)) => {
                    let reason = format!(
                        "worker {} exited while running abandoned work: {}",
                        slot, detail
                    );
                    health.mark_broken(reason.clone());
                    Err(WorkerLost::Exited(reason))
                }
                Err(_) => Err(WorkerLost::Hung(format!(
                    "worker {} hung for more than {:?}",
                    slot, config.hung_task_limit
                ))),
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn read_response(
    lines: &mut Lines<BufReader<ChildStdout>>,
    request: &WorkerRequest,
) -> ReadOutcome {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<WorkerResponse>(&line) {
                Ok(response) if response.answers(request) => return ReadOutcome::Response(response),
                Ok(other) => debug!("Ignoring unrelated worker message: {:?}", other),
                Err(_) => warn!("Ignoring malformed worker output: {}", line),
            },
            Ok(None) => return ReadOutcome::Closed("stdout closed".to_string()),
            Err(e) => return ReadOutcome::Closed(e.to_string()),
        }
    }
}

fn to_reply(response: WorkerResponse, version: &str) -> WorkerReply {
    match response {
        WorkerResponse::Done { result, .. } => WorkerReply::Outcome(TaskOutcome::Completed {
            result,
            version: version.to_string(),
        }),
        WorkerResponse::Failed { error, .. } => WorkerReply::Outcome(TaskOutcome::Failed(error)),
        WorkerResponse::Pong => WorkerReply::Pong,
        WorkerResponse::Ready { .. } => {
            WorkerReply::Outcome(TaskOutcome::Failed("unexpected ready message".to_string()))
        }
    }
}

fn crash_reply(reason: &str) -> WorkerReply {
    WorkerReply::Outcome(TaskOutcome::Failed(format!("worker process exited: {}", reason)))
}

async fn exit_status(child: &mut Child) -> String {
    match timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(_) => "still running".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_caps_env() {
        let command = WorkerCommand::new("/usr/bin/worker").arg("worker").thread_caps(2);

        assert_eq!(command.args(), ["worker".to_string()]);
        let envs = command.envs();
        assert!(envs.contains(&("OMP_NUM_THREADS".to_string(), "2".to_string())));
        assert!(envs.contains(&("TF_NUM_INTRAOP_THREADS".to_string(), "2".to_string())));
        assert!(envs.contains(&("TF_NUM_INTEROP_THREADS".to_string(), "1".to_string())));
        assert_eq!(envs.len(), THREAD_CAP_VARS.len() + 1);
    }

    #[test]
    fn test_ping_reply_mapping() {
        assert!(matches!(
            to_reply(WorkerResponse::Pong, "v1"),
            WorkerReply::Pong
        ));
        match to_reply(
            WorkerResponse::Done {
                id: "t".into(),
                result: serde_json::json!({"ok": true}),
            },
            "v1",
        ) {
            WorkerReply::Outcome(TaskOutcome::Completed { version, .. }) => {
                assert_eq!(version, "v1")
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
