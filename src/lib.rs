//! Shot Engine: Execution and Result Streaming for Compiled Simulation Programs
//!
//! This crate runs a compiled simulation program many times ("shots")
//! against pluggable backend components, fans the shots out across worker
//! processes, and streams each shot's typed results back in a reproducible
//! order under a layered timeout policy.
//!
//! # Overview
//!
//! The engine provides:
//! - [`partition`] to split a shot range across worker processes
//! - [`Worker`] to spawn, connect to and kill one worker process
//! - [`ResultStreamReader`] / [`ResultStreamWriter`] for the line protocol
//! - [`Timeout`] / [`TimerSet`] for the four timer tiers
//! - [`encode_exception`] / [`decode_exception`] for failures that cross the
//!   process boundary
//! - [`ShotStream`] to merge everything into one ordered sequence of shots
//! - [`ShotRunner`] for build roots and the `run` / `run_shots` entry points
//! - [`ExceptionRecord`] and [`EngineError`] for everything that can go wrong
//!
//! # Running shots
//!
//! ```ignore
//! use shot_engine::{Executable, NativePlugin, PluginSet, ShotRunner, Timeout};
//! use std::time::Duration;
//!
//! let runner = ShotRunner::new("/tmp/bell", Executable::new("/tmp/bell/executable/bell")).await?;
//! let plugin = NativePlugin::new("/opt/lib/libquest.so").with_seed(1234).into_arc();
//! let request = runner
//!     .request(PluginSet::new(plugin.clone(), plugin.clone(), plugin), 2)
//!     .with_shots(100)
//!     .with_processes(4)
//!     .with_timeout(Timeout::overall(Duration::from_secs(30)));
//!
//! let mut shots = runner.run_shots(request).await?;
//! while let Some(shot) = shots.next_shot().await {
//!     let shot = shot?;
//!     println!("{}: {:?}", shot.shot_id, shot.get("c0"));
//! }
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   partition() ──→ Worker::spawn() ──→ connect() ──→ next_event()* ──→ reap / kill
//!                                   (backend_startup)  (per_shot, per_result)
//!                   └──────────────────── overall ────────────────────┘
//! ```

pub mod engine;
pub mod error;
pub mod event;
pub mod exception;
pub mod partition;
pub mod plugin;
pub mod run;
pub mod runner;
pub mod stream;
pub mod timeout;
pub mod worker;

pub use engine::{Shot, ShotStream};
pub use error::{EngineError, EngineResult, ExceptionKind, ExceptionRecord};
pub use event::{EventHook, MetricStore};
pub use exception::{decode_exception, encode_exception};
pub use partition::{Partition, ShotRange, owner_of, partition};
pub use plugin::{NativePlugin, Plugin, PluginRole, PluginSet};
pub use run::{Executable, RunRequest};
pub use runner::{BuildLayout, Builder, ShotRunner};
pub use stream::{ResultStreamReader, ResultStreamWriter, ResultValue, TaggedResult};
pub use timeout::{Expired, Timeout, TimerKind, TimerSet};
pub use worker::{KillReason, Worker, WorkerConfig, WorkerExit};
