//! Worker process supervision.
//!
//! One [`Worker`] owns one OS process running one round-robin stride of a
//! run's shots. Its lifecycle:
//!
//! ```text
//!   spawn() ──→ connect() ──→ next_event()* ──→ wait()
//!                  │               │
//!                  └───────────────┴──→ kill(reason)
//! ```
//!
//! **Invariants:**
//! - The worker's stdout and stderr go to files in its own directory under
//!   the run directory, so they survive the process and can be attached
//!   to errors.
//! - Exactly one [`WorkerExit`] is recorded per worker. Whatever is
//!   recorded first (normal exit or a kill) stays.
//! - `kill()` returns only after the process has been reaped, so every
//!   byte it wrote to its capture files is on disk.
//! - The result-stream connection is accepted in the background from the
//!   moment the process starts, whether or not anyone is reading yet. A
//!   worker that connects, writes everything and exits is never mistaken
//!   for one that exited without connecting.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult, ExceptionRecord};
use crate::exception::{CORRUPTED_STDERR, CORRUPTED_STDOUT};
use crate::partition::ShotRange;
use crate::plugin::Plugin;
use crate::run::RunRequest;
use crate::stream::{ResultStreamReader, StreamEvent};

const RESULT_STREAM_SCHEME: &str = "tcp://";

/// How long an exited worker's connection may take to reach the accept task.
const LATE_ACCEPT_GRACE: Duration = Duration::from_millis(100);

/// How one plugin is handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub file: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl PluginConfig {
    fn from_plugin(plugin: &dyn Plugin) -> Self {
        Self {
            file: plugin.library_file().to_path_buf(),
            args: plugin.init_args(),
            seed: plugin.random_seed(),
        }
    }
}

/// Invocation file passed to a worker as `--configuration <file>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub n_qubits: u64,
    pub shots: ShotRange,
    pub simulator: PluginConfig,
    pub runtime: PluginConfig,
    pub error_model: PluginConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
    /// Where to send results, `tcp://<addr>`.
    pub result_stream: String,
    pub stdout_file: PathBuf,
    pub stderr_file: PathBuf,
    pub artifact_dir: PathBuf,
    #[serde(default)]
    pub provide_metrics: bool,
    #[serde(default)]
    pub verbose: bool,
}

impl WorkerConfig {
    pub fn read(path: &Path) -> EngineResult<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::Configuration(format!("{}: {e}", path.display()))
        })
    }

    pub fn to_json(&self) -> EngineResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::Configuration(format!("worker config: {e}")))
    }

    /// Socket address of the result stream.
    pub fn result_stream_addr(&self) -> EngineResult<SocketAddr> {
        self.result_stream
            .strip_prefix(RESULT_STREAM_SCHEME)
            .and_then(|addr| addr.parse().ok())
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "unsupported result stream {:?}",
                    self.result_stream
                ))
            })
    }
}

/// How a worker's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The process exited by itself. `None` if it died from a signal.
    Exited(Option<i32>),
    /// Killed because a timer expired.
    KilledByTimeout,
    /// Killed on the caller's behalf (cancellation or a fatal error elsewhere).
    KilledByCaller,
}

impl WorkerExit {
    fn from_status(status: ExitStatus) -> Self {
        WorkerExit::Exited(status.code())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerExit::Exited(Some(0)))
    }

    pub fn was_killed(&self) -> bool {
        matches!(self, WorkerExit::KilledByTimeout | WorkerExit::KilledByCaller)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Exited(Some(code)) => write!(f, "exit code {code}"),
            WorkerExit::Exited(None) => write!(f, "terminated by signal"),
            WorkerExit::KilledByTimeout => write!(f, "killed by timeout"),
            WorkerExit::KilledByCaller => write!(f, "killed by caller"),
        }
    }
}

/// Why the engine is killing a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Timeout,
    Caller,
}

type Accepted = std::io::Result<(TcpStream, SocketAddr, Instant)>;

enum ConnectOutcome {
    Accepted(Result<Accepted, JoinError>),
    Exited(std::io::Result<ExitStatus>),
}

/// One supervised worker process.
pub struct Worker {
    slot: usize,
    range: ShotRange,
    stdout_file: PathBuf,
    stderr_file: PathBuf,
    child: Child,
    accept: Option<JoinHandle<Accepted>>,
    reader: Option<ResultStreamReader<BufReader<TcpStream>>>,
    connected_at: Option<Instant>,
    exit: Option<WorkerExit>,
}

impl Worker {
    /// Write the worker's invocation file and start its process.
    ///
    /// A process that cannot be started is reported as a runtime failure
    /// carrying the OS diagnostic in `stderr`.
    pub async fn spawn(
        slot: usize,
        request: &RunRequest,
        range: ShotRange,
        run_dir: &Path,
    ) -> EngineResult<Self> {
        let dir = run_dir.join(format!("worker-{slot}"));
        tokio::fs::create_dir_all(&dir).await?;
        let artifact_dir = dir.join("artifacts");
        tokio::fs::create_dir_all(&artifact_dir).await?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let stdout_file = dir.join("stdout.log");
        let stderr_file = dir.join("stderr.log");

        let config = WorkerConfig {
            n_qubits: request.n_qubits,
            shots: range,
            simulator: PluginConfig::from_plugin(request.plugins.simulator.as_ref()),
            runtime: PluginConfig::from_plugin(request.plugins.runtime.as_ref()),
            error_model: PluginConfig::from_plugin(request.plugins.error_model.as_ref()),
            random_seed: request.random_seed,
            result_stream: format!("{RESULT_STREAM_SCHEME}{}", listener.local_addr()?),
            stdout_file: stdout_file.clone(),
            stderr_file: stderr_file.clone(),
            artifact_dir,
            provide_metrics: request.provide_metrics(),
            verbose: request.verbose,
        };
        let config_file = dir.join("config.json");
        tokio::fs::write(&config_file, config.to_json()?).await?;

        let stdout = tokio::fs::File::create(&stdout_file).await?.into_std().await;
        let stderr = tokio::fs::File::create(&stderr_file).await?.into_std().await;

        let executable = &request.executable;
        let mut cmd = Command::new(&executable.path);
        cmd.args(&executable.args)
            .arg("--configuration")
            .arg(&config_file)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        debug!(
            target: "shot_engine::worker",
            slot,
            program = %executable.path.display(),
            offset = range.offset,
            increment = range.increment,
            count = range.count,
            "spawn"
        );
        let child = cmd.spawn().map_err(|e| {
            EngineError::from(
                ExceptionRecord::runtime(format!(
                    "Failed to spawn worker {slot} from '{}'",
                    executable.path.display()
                ))
                .with_output("", e.to_string()),
            )
        })?;

        let accept = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await?;
            Ok((stream, peer, Instant::now()))
        });

        Ok(Self {
            slot,
            range,
            stdout_file,
            stderr_file,
            child,
            accept: Some(accept),
            reader: None,
            connected_at: None,
            exit: None,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Shot ids assigned to this worker.
    pub fn range(&self) -> ShotRange {
        self.range
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    /// Whether a connection is already waiting, so [`Worker::connect`]
    /// will not block.
    pub fn has_pending_connection(&self) -> bool {
        self.accept.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// When the worker opened its result stream, once connected.
    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn stdout_file(&self) -> &Path {
        &self.stdout_file
    }

    pub fn stderr_file(&self) -> &Path {
        &self.stderr_file
    }

    /// The recorded exit, if the process has ended.
    pub fn exit(&self) -> Option<WorkerExit> {
        self.exit
    }

    /// Wait for the worker to open its result stream.
    ///
    /// Unbounded; callers wrap it in the run's timers. A worker that exits
    /// before connecting yields a runtime failure with its captured output.
    pub async fn connect(&mut self) -> EngineResult<()> {
        let Some(accept) = self.accept.as_mut() else {
            return Ok(());
        };
        let outcome = tokio::select! {
            biased;
            accepted = accept => ConnectOutcome::Accepted(accepted),
            status = self.child.wait() => ConnectOutcome::Exited(status),
        };
        match outcome {
            ConnectOutcome::Accepted(accepted) => self.accepted(accepted),
            ConnectOutcome::Exited(status) => {
                let exit = WorkerExit::from_status(status?);
                self.exit.get_or_insert(exit);
                let late = match self.accept.as_mut() {
                    Some(accept) => tokio::time::timeout(LATE_ACCEPT_GRACE, accept).await.ok(),
                    None => None,
                };
                if let Some(accepted) = late {
                    return self.accepted(accepted);
                }
                self.stop_accepting();
                let (stdout, stderr) = self.captured_output().await;
                Err(ExceptionRecord::runtime(format!(
                    "Worker {} exited ({exit}) before connecting to its result stream",
                    self.slot
                ))
                .with_output(stdout, stderr)
                .into())
            }
        }
    }

    fn accepted(&mut self, accepted: Result<Accepted, JoinError>) -> EngineResult<()> {
        self.accept = None;
        let (stream, peer, at) = accepted.map_err(std::io::Error::other)??;
        debug!(target: "shot_engine::worker", slot = self.slot, %peer, "connected");
        self.reader = Some(ResultStreamReader::new(BufReader::new(stream)));
        self.connected_at = Some(at);
        Ok(())
    }

    fn stop_accepting(&mut self) {
        if let Some(accept) = self.accept.take() {
            accept.abort();
        }
    }

    /// Read the next stream event. Unbounded; callers apply timers.
    pub async fn next_event(&mut self) -> EngineResult<StreamEvent> {
        match self.reader.as_mut() {
            Some(reader) => reader.next_event().await,
            None => Err(EngineError::Protocol(format!(
                "worker {} has no open result stream",
                self.slot
            ))),
        }
    }

    /// Wait for the process to end on its own.
    pub async fn wait(&mut self) -> EngineResult<WorkerExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        Ok(*self.exit.get_or_insert(WorkerExit::from_status(status)))
    }

    /// Terminate the process and reap it.
    pub async fn kill(&mut self, reason: KillReason) -> WorkerExit {
        self.reader = None;
        self.stop_accepting();
        if let Some(exit) = self.exit {
            return exit;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            return *self.exit.get_or_insert(WorkerExit::from_status(status));
        }
        debug!(target: "shot_engine::worker", slot = self.slot, ?reason, "kill");
        if let Err(e) = self.child.kill().await {
            warn!(target: "shot_engine::worker", slot = self.slot, error = %e, "kill failed");
        }
        *self.exit.get_or_insert(match reason {
            KillReason::Timeout => WorkerExit::KilledByTimeout,
            KillReason::Caller => WorkerExit::KilledByCaller,
        })
    }

    /// Text of the captured stdout and stderr, with placeholders for
    /// files that cannot be read.
    pub async fn captured_output(&self) -> (String, String) {
        let stdout = tokio::fs::read_to_string(&self.stdout_file)
            .await
            .unwrap_or_else(|_| CORRUPTED_STDOUT.to_string());
        let stderr = tokio::fs::read_to_string(&self.stderr_file)
            .await
            .unwrap_or_else(|_| CORRUPTED_STDERR.to_string());
        (stdout, stderr)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop_accepting();
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("slot", &self.slot)
            .field("range", &self.range)
            .field("connected", &self.is_connected())
            .field("exit", &self.exit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        let plugin = PluginConfig {
            file: "/lib/libsim.so".into(),
            args: vec!["--precision".into(), "double".into()],
            seed: Some(7),
        };
        WorkerConfig {
            n_qubits: 4,
            shots: ShotRange::new(5, 30, 4),
            simulator: plugin.clone(),
            runtime: plugin.clone(),
            error_model: plugin,
            random_seed: None,
            result_stream: "tcp://127.0.0.1:4100".into(),
            stdout_file: "/run/worker-0/stdout.log".into(),
            stderr_file: "/run/worker-0/stderr.log".into(),
            artifact_dir: "/run/worker-0/artifacts".into(),
            provide_metrics: true,
            verbose: false,
        }
    }

    #[test]
    fn test_config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = config();
        std::fs::write(&path, config.to_json().unwrap()).unwrap();
        assert_eq!(WorkerConfig::read(&path).unwrap(), config);
    }

    #[test]
    fn test_result_stream_addr() {
        let mut config = config();
        assert_eq!(
            config.result_stream_addr().unwrap(),
            "127.0.0.1:4100".parse::<SocketAddr>().unwrap()
        );
        config.result_stream = "unix:///tmp/sock".into();
        assert!(config.result_stream_addr().is_err());
    }

    #[test]
    fn test_malformed_config_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{ \"n_qubits\": 1 }").unwrap();
        assert!(matches!(
            WorkerConfig::read(&path),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_worker_exit_display() {
        assert_eq!(WorkerExit::Exited(Some(3)).to_string(), "exit code 3");
        assert_eq!(WorkerExit::Exited(None).to_string(), "terminated by signal");
        assert!(WorkerExit::Exited(Some(0)).is_success());
        assert!(WorkerExit::KilledByTimeout.was_killed());
        assert!(!WorkerExit::Exited(Some(1)).was_killed());
    }
}
