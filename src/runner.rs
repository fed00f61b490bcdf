//! Build roots and the caller-facing entry points.
//!
//! A build root holds everything one compiled program needs:
//!
//! ```text
//!   <root>/
//!     executable/      the built worker executable
//!     artifacts/       intermediate build outputs
//!     runs/
//!       <run-id>/      one per run_shots() call
//!         worker-0/    config.json, stdout.log, stderr.log, artifacts/
//!         worker-1/
//! ```
//!
//! Every `run`/`run_shots` call gets a fresh run directory, so concurrent
//! runs against one root never collide.
//!
//! # Preconditions
//!
//! [`ShotRunner::delete_run_directories`] and [`ShotRunner::delete_files`]
//! must not be called while a run against the same root is in flight. This
//! is not checked.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::engine::ShotStream;
use crate::error::{EngineError, EngineResult};
use crate::plugin::PluginSet;
use crate::run::{Executable, RunRequest};
use crate::stream::TaggedResult;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Directory layout of a build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    pub root: PathBuf,
    pub executable: PathBuf,
    pub artifacts: PathBuf,
    pub runs: PathBuf,
}

impl BuildLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            executable: root.join("executable"),
            artifacts: root.join("artifacts"),
            runs: root.join("runs"),
            root,
        }
    }

    /// Create every directory of the layout.
    pub async fn create(&self) -> EngineResult<()> {
        for dir in [&self.executable, &self.artifacts, &self.runs] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Turns a program into a worker executable.
///
/// The program representation `P` is opaque to the engine. Implementations
/// place their outputs under `layout.executable` and `layout.artifacts` and
/// report failures as [`EngineError::BuildFailure`].
#[async_trait]
pub trait Builder<P: ?Sized + Sync>: Send + Sync {
    async fn build(&self, program: &P, layout: &BuildLayout) -> EngineResult<Executable>;
}

/// A built program, ready to run shots.
#[derive(Debug, Clone)]
pub struct ShotRunner {
    layout: BuildLayout,
    executable: Executable,
}

impl ShotRunner {
    /// Prepare `root` and build `program` into it.
    pub async fn build<P, B>(builder: &B, program: &P, root: impl Into<PathBuf>) -> EngineResult<Self>
    where
        P: ?Sized + Sync,
        B: Builder<P>,
    {
        let layout = BuildLayout::new(root);
        layout.create().await?;
        let executable = builder.build(program, &layout).await?;
        if !tokio::fs::try_exists(&executable.path).await.unwrap_or(false) {
            return Err(EngineError::BuildFailure {
                message: format!(
                    "builder reported '{}' but no such file exists",
                    executable.path.display()
                ),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        info!(
            target: "shot_engine::runner",
            root = %layout.root.display(),
            executable = %executable.path.display(),
            "built"
        );
        Ok(Self { layout, executable })
    }

    /// Use an already built executable with the build root at `root`.
    pub async fn new(root: impl Into<PathBuf>, executable: Executable) -> EngineResult<Self> {
        let layout = BuildLayout::new(root);
        layout.create().await?;
        Ok(Self { layout, executable })
    }

    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    pub fn executable(&self) -> &Executable {
        &self.executable
    }

    /// A request for this runner's executable with default settings.
    pub fn request(&self, plugins: PluginSet, n_qubits: u64) -> RunRequest {
        RunRequest::new(self.executable.clone(), plugins, n_qubits)
    }

    /// Start a run in a fresh run directory.
    pub async fn run_shots(&self, request: RunRequest) -> EngineResult<ShotStream> {
        let run_dir = self.fresh_run_dir().await?;
        ShotStream::start(request, run_dir).await
    }

    /// Run exactly one shot and return its entries.
    pub async fn run(&self, request: RunRequest) -> EngineResult<Vec<TaggedResult>> {
        let shots = self.run_shots(request.with_shots(1)).await?.collect().await?;
        Ok(shots
            .into_iter()
            .next()
            .map(|shot| shot.into_entries())
            .unwrap_or_default())
    }

    /// Remove every run directory. The root stays usable.
    pub async fn delete_run_directories(&self) -> EngineResult<()> {
        match tokio::fs::remove_dir_all(&self.layout.runs).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.layout.runs).await?;
        debug!(target: "shot_engine::runner", runs = %self.layout.runs.display(), "run directories deleted");
        Ok(())
    }

    /// Remove the whole build root. Later runs fail with a not-found I/O error.
    pub async fn delete_files(&self) -> EngineResult<()> {
        tokio::fs::remove_dir_all(&self.layout.root).await?;
        debug!(target: "shot_engine::runner", root = %self.layout.root.display(), "build root deleted");
        Ok(())
    }

    async fn fresh_run_dir(&self) -> EngineResult<PathBuf> {
        let dir = self.layout.runs.join(run_id());
        // not create_dir_all: a deleted root must stay deleted
        tokio::fs::create_dir(&dir).await?;
        Ok(dir)
    }
}

fn run_id() -> String {
    format!(
        "{}-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%.6fZ"),
        std::process::id(),
        RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
