//! Run orchestration.
//!
//! A [`ShotStream`] owns one run: one worker per non-empty partition, the
//! run's [`TimerSet`], and the caller's event hook. Shots are read lazily,
//! one per [`ShotStream::next_shot`] call, always from the worker that owns
//! the next logical index:
//!
//! ```text
//!   index:   0   1   2   3   4   5   6 ...
//!   worker:  0   1   2   0   1   2   0 ...      (n_processes = 3)
//! ```
//!
//! Workers keep computing while the engine reads someone else's shot; their
//! output waits in the socket. Delivery order is therefore the logical
//! index order and never the order in which workers finish.
//!
//! Every blocking wait is bounded by the active timers:
//!
//! | Phase | Active timers | Expiry |
//! |-------|---------------|--------|
//! | connect | `backend_startup`, `overall` | `StartupFailure` |
//! | read | `per_shot`, `per_result`, `overall` | `Timeout` |
//!
//! The first expiry or fatal exception kills every worker and ends the
//! run; nothing is read afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult, ExceptionKind, ExceptionRecord};
use crate::event::{EventHook, split_metric_name};
use crate::exception::{decode_exception, has_exception_metadata, has_exit};
use crate::partition::{ShotRange, owner_of, partition};
use crate::run::RunRequest;
use crate::stream::{Namespace, ResultValue, StreamEvent, Tag, TaggedResult};
use crate::timeout::{Expired, TimerKind, TimerSet};
use crate::worker::{KillReason, Worker, WorkerExit};

const CONNECT_PHASE: &[TimerKind] = &[TimerKind::BackendStartup, TimerKind::Overall];
const READ_PHASE: &[TimerKind] = &[TimerKind::PerShot, TimerKind::PerResult, TimerKind::Overall];

/// Longest wait for a worker to exit on its own once its stream is done.
const REAP_GRACE: Duration = Duration::from_secs(1);

/// The results of one shot.
///
/// With parsed results each entry's `tag` is the bare result name (or
/// `exit: <message>` for an exit); otherwise it is the raw wire tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Shot {
    /// Logical position in the run, starting at 0.
    pub index: u64,
    /// Absolute shot id.
    pub shot_id: u64,
    pub entries: Vec<TaggedResult>,
}

impl Shot {
    /// First value recorded under `tag`.
    pub fn get(&self, tag: &str) -> Option<&ResultValue> {
        self.entries
            .iter()
            .find(|entry| entry.tag == tag)
            .map(|entry| &entry.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResultValue)> {
        self.entries
            .iter()
            .map(|entry| (entry.tag.as_str(), &entry.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<TaggedResult> {
        self.entries
    }
}

/// Why a shot could not be read.
enum Interrupt {
    /// Timers expired while waiting on worker `slot`.
    Expired {
        kind: ExceptionKind,
        message: String,
        slot: usize,
    },
    Failed(EngineError),
}

impl From<EngineError> for Interrupt {
    fn from(err: EngineError) -> Self {
        Interrupt::Failed(err)
    }
}

enum Outcome {
    Shot(Shot),
    /// The shot ended in an exception that halts the run.
    Fatal(Shot, ExceptionRecord),
}

/// Lazy, single-use sequence of a run's shots in logical order.
pub struct ShotStream {
    run_dir: PathBuf,
    range: ShotRange,
    n_processes: usize,
    workers: Vec<Worker>,
    timers: TimerSet,
    parse_results: bool,
    event_hook: Option<Box<dyn EventHook>>,
    next_index: u64,
    pending: Option<EngineError>,
    finished: bool,
}

impl ShotStream {
    /// Validate `request`, check its plugins and spawn its workers into
    /// `run_dir`.
    ///
    /// A plugin library that cannot be loaded fails the run before any
    /// process is started, as a runtime failure whose stderr names it.
    pub async fn start(request: RunRequest, run_dir: impl Into<PathBuf>) -> EngineResult<Self> {
        request.validate()?;
        let run_dir = run_dir.into();
        let range = request.shot_range();

        if let Err(diagnostic) = request.plugins.check_libraries() {
            warn!(target: "shot_engine::engine", %diagnostic, "plugin check failed");
            return Err(ExceptionRecord::RuntimeFailure {
                message: "Failed to start workers: a plugin library could not be loaded".into(),
                stdout: String::new(),
                stderr: diagnostic,
            }
            .into());
        }

        tokio::fs::create_dir_all(&run_dir).await?;
        info!(
            target: "shot_engine::engine",
            run_dir = %run_dir.display(),
            n_shots = range.count,
            n_processes = request.n_processes,
            "run start"
        );

        let timers = TimerSet::start(&request.timeout);
        let mut workers: Vec<Worker> = Vec::new();
        for part in partition(&range, request.n_processes)? {
            if part.is_empty() {
                continue;
            }
            match Worker::spawn(part.worker, &request, part.range, &run_dir).await {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    for worker in &mut workers {
                        worker.kill(KillReason::Caller).await;
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            run_dir,
            range,
            n_processes: request.n_processes,
            workers,
            timers,
            parse_results: request.parse_results,
            event_hook: request.event_hook,
            next_index: 0,
            pending: None,
            finished: false,
        })
    }

    /// Directory holding this run's worker configs and captured output.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Shots delivered so far.
    pub fn delivered(&self) -> u64 {
        self.next_index
    }

    /// Whether the stream will yield nothing more.
    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_none()
    }

    /// Recorded exit of each spawned worker, by slot.
    pub fn worker_exits(&self) -> Vec<Option<WorkerExit>> {
        self.workers.iter().map(Worker::exit).collect()
    }

    /// The next shot, an error that ends the run, or `None` once the run
    /// is over.
    pub async fn next_shot(&mut self) -> Option<EngineResult<Shot>> {
        if let Some(err) = self.pending.take() {
            return Some(Err(err));
        }
        if self.finished {
            return None;
        }
        if self.next_index >= self.range.count {
            self.finish().await;
            return None;
        }

        let index = self.next_index;
        match self.read_shot(index).await {
            Ok(Outcome::Shot(shot)) => {
                self.next_index += 1;
                Some(Ok(shot))
            }
            Ok(Outcome::Fatal(shot, record)) => {
                warn!(
                    target: "shot_engine::engine",
                    shot_id = shot.shot_id,
                    kind = record.as_label(),
                    "shot ended the run"
                );
                self.abort(KillReason::Caller).await;
                if self.parse_results {
                    Some(Err(record.into()))
                } else {
                    self.next_index += 1;
                    self.pending = Some(record.into());
                    Some(Ok(shot))
                }
            }
            Err(Interrupt::Expired {
                kind,
                message,
                slot,
            }) => {
                warn!(target: "shot_engine::engine", %message, "timers expired");
                self.abort(KillReason::Timeout).await;
                let (stdout, stderr) = match self.workers.get(slot) {
                    Some(worker) => worker.captured_output().await,
                    None => Default::default(),
                };
                Some(Err(
                    ExceptionRecord::new(kind, message, 0, stdout, stderr).into()
                ))
            }
            Err(Interrupt::Failed(err)) => {
                warn!(target: "shot_engine::engine", error = %err, "run failed");
                self.abort(KillReason::Caller).await;
                Some(Err(err))
            }
        }
    }

    /// Drain the stream. Stops at the first error.
    pub async fn collect(mut self) -> EngineResult<Vec<Shot>> {
        let mut shots = Vec::new();
        while let Some(shot) = self.next_shot().await {
            shots.push(shot?);
        }
        Ok(shots)
    }

    /// Kill every live worker. The stream yields nothing afterwards.
    pub async fn cancel(&mut self) {
        if !self.finished {
            info!(target: "shot_engine::engine", delivered = self.next_index, "run cancelled");
        }
        self.pending = None;
        self.abort(KillReason::Caller).await;
    }

    async fn read_shot(&mut self, index: u64) -> Result<Outcome, Interrupt> {
        let (slot, _) = owner_of(index, self.n_processes);
        let shot_id = self.range.shot_id(index);
        let worker = self.workers.get_mut(slot).ok_or_else(|| {
            EngineError::Protocol(format!("no worker owns shot index {index}"))
        })?;

        if !worker.is_connected() {
            // A connection that arrived while other shots were being read is
            // judged by when it arrived, not by when it is picked up.
            let expired = if worker.has_pending_connection() {
                worker.connect().await?;
                let late = worker
                    .connected_at()
                    .map(|at| self.timers.expired_at(CONNECT_PHASE, at))
                    .unwrap_or_default();
                (!late.is_empty()).then_some(Expired(late))
            } else {
                match self.timers.bound(CONNECT_PHASE, worker.connect()).await {
                    Ok(connected) => {
                        connected?;
                        None
                    }
                    Err(expired) => Some(expired),
                }
            };
            if let Some(expired) = expired {
                return Err(Interrupt::Expired {
                    kind: ExceptionKind::StartupFailure,
                    message: format!(
                        "Timed out waiting for a client to connect for shot {shot_id}. {expired}"
                    ),
                    slot,
                });
            }
        }

        self.timers.reset(TimerKind::PerShot);
        let mut entries = Vec::new();
        let complete = loop {
            self.timers.reset(TimerKind::PerResult);
            let event = match self.timers.bound(READ_PHASE, worker.next_event()).await {
                Ok(event) => event?,
                Err(expired) => {
                    return Err(Interrupt::Expired {
                        kind: ExceptionKind::Timeout,
                        message: format!(
                            "Timed out waiting for results for shot {shot_id}. {expired}"
                        ),
                        slot,
                    });
                }
            };
            match event {
                StreamEvent::Entry(entry) => entries.push(entry),
                StreamEvent::ShotBoundary => break true,
                StreamEvent::EndOfStream { truncated } => {
                    debug!(target: "shot_engine::engine", slot, shot_id, truncated, "stream ended mid-shot");
                    break false;
                }
            }
        };

        // A lone EXIT with a boundary is a benign early end of the shot.
        let fatal = if complete && !has_exception_metadata(&entries) {
            None
        } else if complete || has_exit(&entries) {
            decode_exception(&entries)?
        } else {
            let exit = reap(worker, reap_grace(&self.timers)).await;
            let (stdout, stderr) = worker.captured_output().await;
            Some(
                ExceptionRecord::runtime(format!(
                    "Worker terminated unexpectedly during shot {shot_id} ({exit})"
                ))
                .with_output(stdout, stderr),
            )
        };

        let shot = self.present(index, shot_id, entries);
        Ok(match fatal {
            Some(record) => Outcome::Fatal(shot, record),
            None => Outcome::Shot(shot),
        })
    }

    /// Route metrics to the hook and shape entries for the caller.
    fn present(&mut self, index: u64, shot_id: u64, entries: Vec<TaggedResult>) -> Shot {
        if let Some(hook) = self.event_hook.as_mut() {
            hook.on_shot_start(shot_id);
        }
        let mut shown = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.parsed_tag() {
                Ok(Tag {
                    namespace: Namespace::Metrics,
                    name,
                    ..
                }) => {
                    if let Some(hook) = self.event_hook.as_mut() {
                        let (category, name) = split_metric_name(name);
                        hook.on_metric(shot_id, category, name, &entry.value);
                    }
                    if self.parse_results {
                        continue;
                    }
                }
                Ok(Tag {
                    namespace: Namespace::User,
                    name,
                    ..
                }) if self.parse_results => {
                    shown.push(TaggedResult::new(name, entry.value.clone()));
                    continue;
                }
                Ok(Tag {
                    namespace: Namespace::Exit,
                    name,
                    ..
                }) if self.parse_results => {
                    shown.push(TaggedResult::new(format!("exit: {name}"), entry.value.clone()));
                    continue;
                }
                _ if self.parse_results => continue,
                _ => {}
            }
            shown.push(entry);
        }
        if let Some(hook) = self.event_hook.as_mut() {
            hook.on_shot_end(shot_id);
        }
        Shot {
            index,
            shot_id,
            entries: shown,
        }
    }

    async fn abort(&mut self, reason: KillReason) {
        self.finished = true;
        for worker in &mut self.workers {
            worker.kill(reason).await;
        }
    }

    /// Reap every worker after the last shot.
    async fn finish(&mut self) {
        self.finished = true;
        let grace = reap_grace(&self.timers);
        for worker in &mut self.workers {
            let exit = reap(worker, grace).await;
            debug!(target: "shot_engine::engine", slot = worker.slot(), %exit, "reaped");
        }
        info!(target: "shot_engine::engine", delivered = self.next_index, "run finished");
    }
}

/// Reaping never outlives the `overall` timer.
fn reap_grace(timers: &TimerSet) -> Duration {
    timers
        .min_remaining(&[TimerKind::Overall])
        .map_or(REAP_GRACE, |remaining| remaining.min(REAP_GRACE))
}

/// Wait up to `grace` for `worker` to exit, then kill it.
async fn reap(worker: &mut Worker, grace: Duration) -> WorkerExit {
    match tokio::time::timeout(grace, worker.wait()).await {
        Ok(Ok(exit)) => exit,
        Ok(Err(err)) => {
            warn!(target: "shot_engine::engine", slot = worker.slot(), error = %err, "wait failed");
            worker.kill(KillReason::Caller).await
        }
        Err(_) => {
            warn!(target: "shot_engine::engine", slot = worker.slot(), "worker outlived its stream; killing");
            worker.kill(KillReason::Caller).await
        }
    }
}

impl fmt::Debug for ShotStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShotStream")
            .field("run_dir", &self.run_dir)
            .field("range", &self.range)
            .field("workers", &self.workers)
            .field("next_index", &self.next_index)
            .field("finished", &self.finished)
            .finish()
    }
}
