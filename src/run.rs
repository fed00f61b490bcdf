//! Run configuration.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::event::EventHook;
use crate::partition::ShotRange;
use crate::plugin::PluginSet;
use crate::timeout::Timeout;

/// A compiled program that speaks the result-stream protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executable {
    pub path: PathBuf,
    /// Arguments placed before `--configuration <file>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Executable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Everything needed to run a batch of shots.
///
/// Owned by the caller and handed to the engine by value.
pub struct RunRequest {
    pub executable: Executable,
    pub plugins: PluginSet,
    pub n_qubits: u64,
    pub shot_offset: u64,
    pub shot_increment: u64,
    pub n_shots: u64,
    pub n_processes: usize,
    pub timeout: Timeout,
    /// Ask workers for metrics and diagnostics.
    pub verbose: bool,
    /// Expose `(name, value)` pairs instead of raw tags.
    pub parse_results: bool,
    /// Seed for the program's own random number generator.
    pub random_seed: Option<u64>,
    pub event_hook: Option<Box<dyn EventHook>>,
}

impl RunRequest {
    /// One shot, id 0, one worker, no timeouts, parsed results.
    pub fn new(executable: Executable, plugins: PluginSet, n_qubits: u64) -> Self {
        Self {
            executable,
            plugins,
            n_qubits,
            shot_offset: 0,
            shot_increment: 1,
            n_shots: 1,
            n_processes: 1,
            timeout: Timeout::unbounded(),
            verbose: false,
            parse_results: true,
            random_seed: None,
            event_hook: None,
        }
    }

    pub fn with_shots(mut self, n_shots: u64) -> Self {
        self.n_shots = n_shots;
        self
    }

    pub fn with_shot_offset(mut self, offset: u64) -> Self {
        self.shot_offset = offset;
        self
    }

    pub fn with_shot_increment(mut self, increment: u64) -> Self {
        self.shot_increment = increment;
        self
    }

    pub fn with_processes(mut self, n_processes: usize) -> Self {
        self.n_processes = n_processes;
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_parse_results(mut self, parse_results: bool) -> Self {
        self.parse_results = parse_results;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn with_event_hook(mut self, hook: impl EventHook + 'static) -> Self {
        self.event_hook = Some(Box::new(hook));
        self
    }

    /// The logical shot sequence of this run.
    pub fn shot_range(&self) -> ShotRange {
        ShotRange::new(self.shot_offset, self.shot_increment, self.n_shots)
    }

    /// Whether workers should emit `METRICS` entries.
    pub fn provide_metrics(&self) -> bool {
        self.verbose || self.event_hook.as_ref().is_some_and(|hook| hook.wants_metrics())
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.n_processes == 0 {
            return Err(EngineError::Configuration(
                "n_processes must be at least 1".into(),
            ));
        }
        if self.executable.path.as_os_str().is_empty() {
            return Err(EngineError::Configuration("executable path is empty".into()));
        }
        self.shot_range().check()
    }
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRequest")
            .field("executable", &self.executable)
            .field("plugins", &self.plugins)
            .field("n_qubits", &self.n_qubits)
            .field("shots", &self.shot_range())
            .field("n_processes", &self.n_processes)
            .field("timeout", &self.timeout)
            .field("verbose", &self.verbose)
            .field("parse_results", &self.parse_results)
            .field("random_seed", &self.random_seed)
            .field("event_hook", &self.event_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::MetricStore;
    use crate::plugin::NativePlugin;

    fn request() -> RunRequest {
        let plugin = NativePlugin::new("/lib/libsim.so").into_arc();
        RunRequest::new(
            Executable::new("/build/executable"),
            PluginSet::new(plugin.clone(), plugin.clone(), plugin),
            4,
        )
    }

    #[test]
    fn test_defaults() {
        let request = request();
        assert_eq!(request.shot_range(), ShotRange::new(0, 1, 1));
        assert_eq!(request.n_processes, 1);
        assert!(request.parse_results);
        assert!(!request.provide_metrics());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let request = request()
            .with_shots(100)
            .with_shot_offset(5)
            .with_shot_increment(10)
            .with_processes(3)
            .with_timeout(Duration::from_secs(2));
        assert_eq!(request.shot_range(), ShotRange::new(5, 10, 100));
        assert_eq!(request.timeout.overall, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_hook_turns_on_metrics() {
        assert!(request().with_event_hook(MetricStore::new()).provide_metrics());
        assert!(request().with_verbose(true).provide_metrics());
    }

    #[test]
    fn test_validation() {
        assert!(request().with_processes(0).validate().is_err());
        assert!(
            request()
                .with_shot_offset(u64::MAX)
                .with_shots(2)
                .validate()
                .is_err()
        );
    }
}
