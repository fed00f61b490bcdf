//! Error types.
//!
//! Failures are split in two layers:
//!
//! | Type | Variants | Meaning |
//! |------|----------|---------|
//! | [`ExceptionRecord`] | `Panic`, `RuntimeFailure`, `StartupFailure`, `Timeout` | A shot (or the run) terminated exceptionally. Crosses the process boundary through the result stream. |
//! | [`EngineError`] | `Exception`, `BuildFailure`, `Protocol`, `Configuration`, `Io` | Everything the engine can return to a caller. |
//!
//! Every [`ExceptionRecord`] carries the text the worker wrote to its
//! captured stdout and stderr, so callers can see what the program printed
//! before it failed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind tag of an [`ExceptionRecord`], as written into the result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    /// Explicit, program-triggered irrecoverable termination.
    Panic,
    /// Unexpected worker failure or corrupted exception encoding.
    RuntimeFailure,
    /// No worker connected in time, or a plugin failed to load.
    StartupFailure,
    /// A timer tier expired.
    Timeout,
}

impl ExceptionKind {
    /// Stable wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionKind::Panic => "Panic",
            ExceptionKind::RuntimeFailure => "RuntimeFailure",
            ExceptionKind::StartupFailure => "StartupFailure",
            ExceptionKind::Timeout => "Timeout",
        }
    }

    /// Parse a wire name. Unknown names yield `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "Panic" => Some(ExceptionKind::Panic),
            "RuntimeFailure" => Some(ExceptionKind::RuntimeFailure),
            "StartupFailure" => Some(ExceptionKind::StartupFailure),
            "Timeout" => Some(ExceptionKind::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured representation of an exceptional shot termination.
///
/// Constructed either locally by the engine (startup and timeout
/// detection) or reconstructed from a worker's terminal stream entries.
/// Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExceptionRecord {
    /// The program panicked. Halts the whole run.
    #[error("Panic (code {code}): {message}")]
    Panic {
        message: String,
        code: i64,
        stdout: String,
        stderr: String,
    },

    /// The worker failed unexpectedly.
    #[error("Runtime failure: {message}")]
    RuntimeFailure {
        message: String,
        stdout: String,
        stderr: String,
    },

    /// The worker could not be started or never connected.
    #[error("Startup failure: {message}")]
    StartupFailure {
        message: String,
        stdout: String,
        stderr: String,
    },

    /// A timer expired.
    #[error("Timeout: {message}")]
    Timeout {
        message: String,
        stdout: String,
        stderr: String,
    },
}

impl ExceptionRecord {
    /// Build a record of the given kind. `code` is only kept for panics.
    pub fn new(
        kind: ExceptionKind,
        message: impl Into<String>,
        code: i64,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        let (message, stdout, stderr) = (message.into(), stdout.into(), stderr.into());
        match kind {
            ExceptionKind::Panic => ExceptionRecord::Panic {
                message,
                code,
                stdout,
                stderr,
            },
            ExceptionKind::RuntimeFailure => ExceptionRecord::RuntimeFailure {
                message,
                stdout,
                stderr,
            },
            ExceptionKind::StartupFailure => ExceptionRecord::StartupFailure {
                message,
                stdout,
                stderr,
            },
            ExceptionKind::Timeout => ExceptionRecord::Timeout {
                message,
                stdout,
                stderr,
            },
        }
    }

    /// A runtime failure with no captured output.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::RuntimeFailure, message, 0, "", "")
    }

    pub fn kind(&self) -> ExceptionKind {
        match self {
            ExceptionRecord::Panic { .. } => ExceptionKind::Panic,
            ExceptionRecord::RuntimeFailure { .. } => ExceptionKind::RuntimeFailure,
            ExceptionRecord::StartupFailure { .. } => ExceptionKind::StartupFailure,
            ExceptionRecord::Timeout { .. } => ExceptionKind::Timeout,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ExceptionRecord::Panic { message, .. }
            | ExceptionRecord::RuntimeFailure { message, .. }
            | ExceptionRecord::StartupFailure { message, .. }
            | ExceptionRecord::Timeout { message, .. } => message,
        }
    }

    /// Panic code, if this is a panic.
    pub fn code(&self) -> Option<i64> {
        match self {
            ExceptionRecord::Panic { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn stdout(&self) -> &str {
        match self {
            ExceptionRecord::Panic { stdout, .. }
            | ExceptionRecord::RuntimeFailure { stdout, .. }
            | ExceptionRecord::StartupFailure { stdout, .. }
            | ExceptionRecord::Timeout { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            ExceptionRecord::Panic { stderr, .. }
            | ExceptionRecord::RuntimeFailure { stderr, .. }
            | ExceptionRecord::StartupFailure { stderr, .. }
            | ExceptionRecord::Timeout { stderr, .. } => stderr,
        }
    }

    /// Replace the captured stdout/stderr, keeping kind, message and code.
    pub fn with_output(self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        let code = self.code().unwrap_or(0);
        let kind = self.kind();
        let message = match self {
            ExceptionRecord::Panic { message, .. }
            | ExceptionRecord::RuntimeFailure { message, .. }
            | ExceptionRecord::StartupFailure { message, .. }
            | ExceptionRecord::Timeout { message, .. } => message,
        };
        Self::new(kind, message, code, stdout, stderr)
    }

    /// Short snake_case label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ExceptionRecord::Panic { .. } => "shot_panic",
            ExceptionRecord::RuntimeFailure { .. } => "shot_runtime_failure",
            ExceptionRecord::StartupFailure { .. } => "shot_startup_failure",
            ExceptionRecord::Timeout { .. } => "shot_timeout",
        }
    }
}

/// Errors returned by the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A shot or the run terminated exceptionally.
    #[error(transparent)]
    Exception(#[from] ExceptionRecord),

    /// Artifact construction failed (raised by a [`crate::Builder`]).
    #[error("Build failed: {message}")]
    BuildFailure {
        message: String,
        stdout: String,
        stderr: String,
    },

    /// Producer and consumer disagree about the stream protocol.
    /// Never user-recoverable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid run configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Filesystem or socket failure in the orchestrator itself.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The exception record, if this error is one.
    pub fn as_exception(&self) -> Option<&ExceptionRecord> {
        match self {
            EngineError::Exception(record) => Some(record),
            _ => None,
        }
    }

    /// Returns `true` for internal-consistency failures that indicate a bug
    /// or version drift rather than a problem with the program being run.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::Protocol(_))
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
