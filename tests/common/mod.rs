#![allow(dead_code)]

use std::path::{Path, PathBuf};

use shot_engine::{
    EngineError, EngineResult, Executable, ExceptionRecord, NativePlugin, PluginSet, RunRequest,
    Shot, ShotRunner, TaggedResult,
};

pub const SIMULATOR_SEED: u64 = 1234;
pub const ERROR_MODEL_SEED: u64 = 5678;

/// The reference worker binary.
pub fn worker_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_shot-worker"))
}

/// A shared library already mapped into this process, so workers can
/// load it too.
pub fn native_library() -> PathBuf {
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    let mapped: Vec<&str> = maps
        .lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .filter(|path| path.starts_with('/') && path.contains(".so"))
        .collect();
    let path = mapped
        .iter()
        .find(|path| path.contains("/libc.so"))
        .or_else(|| mapped.first())
        .expect("no shared library mapped");
    PathBuf::from(path)
}

/// Plugins backed by a real native library.
pub fn plugins() -> PluginSet {
    let library = native_library();
    PluginSet::new(
        NativePlugin::new(&library)
            .with_args(["--precision", "double"])
            .with_seed(SIMULATOR_SEED)
            .into_arc(),
        NativePlugin::new(&library).into_arc(),
        NativePlugin::new(&library)
            .with_args(["--p1", "0.001"])
            .with_seed(ERROR_MODEL_SEED)
            .into_arc(),
    )
}

/// A runner rooted in `root` that runs `shot-worker <args...>`.
pub async fn runner(root: &Path, args: &[&str]) -> ShotRunner {
    ShotRunner::new(root, Executable::new(worker_exe()).with_args(args.iter().copied()))
        .await
        .unwrap()
}

pub fn request(runner: &ShotRunner, n_qubits: u64) -> RunRequest {
    runner.request(plugins(), n_qubits)
}

pub async fn collect(runner: &ShotRunner, request: RunRequest) -> EngineResult<Vec<Shot>> {
    runner.run_shots(request).await?.collect().await
}

/// Shot ids and entries, without the run-relative index.
pub fn by_id(shots: &[Shot]) -> Vec<(u64, Vec<TaggedResult>)> {
    shots
        .iter()
        .map(|shot| (shot.shot_id, shot.entries.clone()))
        .collect()
}

pub fn exception(err: EngineError) -> ExceptionRecord {
    match err {
        EngineError::Exception(record) => record,
        other => panic!("expected an exception record, got {other:?}"),
    }
}
