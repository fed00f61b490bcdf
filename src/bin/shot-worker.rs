//! Reference worker for the shot engine.
//!
//! Runs one of a few built-in programs over the shot range in its
//! invocation file and writes the results to the engine's result stream:
//!
//! ```text
//!   shot-worker <program> [--at N] [--exit-probability P] --configuration <file>
//! ```
//!
//! Results depend only on the plugin seeds and the absolute shot id, so any
//! partitioning of a run reproduces the same shots.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use libloading::Library;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use tokio::io::BufWriter;
use tokio::net::TcpStream;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use shot_engine::exception::encode_exception;
use shot_engine::plugin::{PluginRole, check_native_library};
use shot_engine::stream::{ResultStreamWriter, ResultValue};
use shot_engine::worker::{PluginConfig, WorkerConfig};
use shot_engine::{EngineResult, ExceptionRecord};

type Writer = ResultStreamWriter<BufWriter<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Program {
    /// Measure every qubit and draw one integer.
    Measure,
    /// Emit one result of each array type and a label.
    Arrays,
    /// Exit early with probability `--exit-probability`, succeed otherwise.
    ExitOrSucceed,
    /// Panic with code 1001 at shot `--at`.
    PanicAt,
    /// Like `panic-at`, but die after half of the exception tail.
    TruncatedPanicAt,
    /// Exit abruptly in the middle of shot `--at`.
    CrashAt,
    /// Emit a result every 100 ms, forever.
    Loop,
    /// Run forever without emitting anything.
    LoopSilent,
    /// Never open the result stream.
    NeverConnect,
}

#[derive(Debug, Parser)]
#[command(name = "shot-worker", about = "Reference worker for the shot engine")]
struct Args {
    #[arg(value_enum)]
    program: Program,

    /// Shot id at which the failing programs fail.
    #[arg(long, default_value_t = 0)]
    at: u64,

    /// Early-exit probability for `exit-or-succeed`.
    #[arg(long, default_value_t = 0.5)]
    exit_probability: f64,

    /// Invocation file written by the engine.
    #[arg(long)]
    configuration: PathBuf,
}

enum ShotEnd {
    Boundary,
    Halt(u8),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match WorkerConfig::read(&args.configuration) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("shot-worker: {e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(config.verbose);

    // held until exit so the plugins stay loaded for every shot
    let _plugins = match load_plugins(&config) {
        Ok(plugins) => plugins,
        Err(reason) => {
            eprintln!("{reason}");
            return ExitCode::from(2);
        }
    };

    match run(&args, &config).await {
        Ok(code) => code,
        Err(e) => {
            error!(target: "shot_worker", error = %e, "worker failed");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "shot_worker=debug" } else { "shot_worker=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn load_plugins(config: &WorkerConfig) -> Result<Vec<Library>, String> {
    let mut loaded = Vec::with_capacity(3);
    for (role, plugin) in [
        (PluginRole::Simulator, &config.simulator),
        (PluginRole::Runtime, &config.runtime),
        (PluginRole::ErrorModel, &config.error_model),
    ] {
        let library = check_native_library(&plugin.file)
            .and_then(|()| {
                // SAFETY: plugin libraries are trusted native components;
                // loading them runs their initialisers.
                unsafe { Library::new(&plugin.file) }.map_err(|e| e.to_string())
            })
            .map_err(|reason| {
                format!(
                    "Failed to load {role} plugin from '{}': {reason}",
                    plugin.file.display()
                )
            })?;
        debug!(target: "shot_worker", %role, file = %plugin.file.display(), args = ?plugin.args, "plugin loaded");
        loaded.push(library);
    }
    Ok(loaded)
}

async fn run(args: &Args, config: &WorkerConfig) -> EngineResult<ExitCode> {
    if args.program == Program::NeverConnect {
        info!(target: "shot_worker", "never connecting");
        std::future::pending::<()>().await;
    }

    let stream = TcpStream::connect(config.result_stream_addr()?).await?;
    let mut writer = ResultStreamWriter::new(BufWriter::new(stream));
    for shot_id in config.shots.ids() {
        debug!(target: "shot_worker", shot_id, "shot start");
        match run_shot(args, config, &mut writer, shot_id).await? {
            ShotEnd::Boundary => writer.end_shot().await?,
            ShotEnd::Halt(code) => {
                writer.flush().await?;
                return Ok(ExitCode::from(code));
            }
        }
    }
    writer.flush().await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_shot(
    args: &Args,
    config: &WorkerConfig,
    writer: &mut Writer,
    shot_id: u64,
) -> EngineResult<ShotEnd> {
    let mut rng = shot_rng(config, shot_id);
    if config.provide_metrics {
        let qubits = ResultValue::Int(config.n_qubits as i64);
        writer.write_metric("user_program", "qalloc_count", &qubits).await?;
        writer
            .write_metric("emulator", "shot_number", &ResultValue::Int(shot_id as i64))
            .await?;
    }

    match args.program {
        Program::Measure => {
            for q in 0..config.n_qubits {
                let bit = ResultValue::Bool(rng.random());
                writer.write_user(&format!("c{q}"), &bit).await?;
            }
            let outcome = ResultValue::Int(rng.random_range(0..i64::MAX));
            writer.write_user("outcome", &outcome).await?;
        }
        Program::Arrays => {
            let bits = (0..config.n_qubits).map(|_| rng.random()).collect();
            let counts = (0..3).map(|_| rng.random_range(0..100)).collect();
            let angles = (0..3).map(|_| rng.random::<f64>()).collect();
            writer.write_user("bits", &ResultValue::BoolArray(bits)).await?;
            writer.write_user("counts", &ResultValue::IntArray(counts)).await?;
            writer.write_user("angles", &ResultValue::FloatArray(angles)).await?;
            writer
                .write_user("label", &ResultValue::String(format!("shot {shot_id}")))
                .await?;
        }
        Program::ExitOrSucceed => {
            if rng.random::<f64>() < args.exit_probability {
                writer.write_exit("Postselection failed", 1).await?;
            } else {
                writer.write_user("success", &ResultValue::Bool(true)).await?;
            }
        }
        Program::PanicAt | Program::TruncatedPanicAt | Program::CrashAt => {
            if shot_id == args.at {
                return fail(args.program, config, writer, shot_id).await;
            }
            writer.write_user("ok", &ResultValue::Bool(true)).await?;
        }
        Program::Loop => {
            let mut tick = 0;
            loop {
                writer.write_user("tick", &ResultValue::Int(tick)).await?;
                writer.flush().await?;
                tick += 1;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Program::LoopSilent | Program::NeverConnect => std::future::pending::<()>().await,
    }
    Ok(ShotEnd::Boundary)
}

async fn fail(
    program: Program,
    config: &WorkerConfig,
    writer: &mut Writer,
    shot_id: u64,
) -> EngineResult<ShotEnd> {
    println!("shot {shot_id}: about to fail");
    eprintln!("shot {shot_id}: giving up");
    std::io::stdout().flush()?;

    if program == Program::CrashAt {
        writer.write_user("partial", &ResultValue::Int(1)).await?;
        return Ok(ShotEnd::Halt(3));
    }

    let record = ExceptionRecord::Panic {
        message: "Postselection failed".into(),
        code: 1001,
        stdout: String::new(),
        stderr: String::new(),
    };
    let tail = encode_exception(&record, &config.stdout_file, &config.stderr_file);
    let keep = if program == Program::TruncatedPanicAt { 2 } else { tail.len() };
    for entry in &tail[..keep] {
        writer.write_entry(entry).await?;
    }
    Ok(ShotEnd::Halt(1))
}

/// Generator for one shot, seeded from `seed + shot_id` of each plugin.
fn shot_rng(config: &WorkerConfig, shot_id: u64) -> Pcg32 {
    let seed = |plugin: &PluginConfig| plugin.seed.unwrap_or(0).wrapping_add(shot_id);
    let mut state = seed(&config.simulator) ^ seed(&config.error_model).rotate_left(32);
    if let Some(random_seed) = config.random_seed {
        state ^= random_seed.wrapping_add(shot_id).rotate_left(17);
    }
    Pcg32::seed_from_u64(state)
}
