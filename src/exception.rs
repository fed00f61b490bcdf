//! Exception encoding across the process boundary.
//!
//! A worker that terminates a shot exceptionally appends four entries, in
//! this order:
//!
//! ```text
//!   EXIT:INT:<message>          <code>
//!   _EXCEPTION:INT:<kind>       0
//!   _STDERR:INT:<stderr path>   0
//!   _STDOUT:INT:<stdout path>   0
//! ```
//!
//! A lone `EXIT` entry without the three metadata entries is a benign
//! early exit of one shot and is not an exception.
//!
//! Decoding scans from the end of the shot and takes the last occurrence of
//! each marker, so metrics written before (or between) the markers do not
//! disturb it. A missing marker degrades to a [`ExceptionRecord::RuntimeFailure`]
//! naming what was missing; decoding itself never fails on a truncated tail.

use std::path::Path;

use crate::error::{EngineError, EngineResult, ExceptionKind, ExceptionRecord};
use crate::stream::{ResultValue, TaggedResult};

pub const EXIT_PREFIX: &str = "EXIT:INT:";
pub const EXCEPTION_TYPE_PREFIX: &str = "_EXCEPTION:INT:";
pub const STDERR_PREFIX: &str = "_STDERR:INT:";
pub const STDOUT_PREFIX: &str = "_STDOUT:INT:";

/// Code attached to runtime failures that carry no explicit code.
pub const RUNTIME_FAILURE_CODE: i64 = 110000;
/// Code attached to startup failures.
pub const STARTUP_FAILURE_CODE: i64 = 110001;
/// Code attached to timeouts.
pub const TIMEOUT_CODE: i64 = 110002;

pub(crate) const CORRUPTED_STDOUT: &str = "Corrupted stdout.";
pub(crate) const CORRUPTED_STDERR: &str = "Corrupted stderr.";

/// Tag for an `EXIT` entry with `message`. An existing prefix is kept.
pub fn exit_tag(message: &str) -> String {
    if message.starts_with(EXIT_PREFIX) {
        message.to_string()
    } else {
        format!("{EXIT_PREFIX}{message}")
    }
}

/// Encode `record` as the four tail entries of a shot.
///
/// The record's own stdout/stderr text is not sent; the consumer reads it
/// back from the two files.
pub fn encode_exception(
    record: &ExceptionRecord,
    stdout_file: &Path,
    stderr_file: &Path,
) -> [TaggedResult; 4] {
    let code = match record {
        ExceptionRecord::Panic { code, .. } => *code,
        ExceptionRecord::RuntimeFailure { .. } => RUNTIME_FAILURE_CODE,
        ExceptionRecord::StartupFailure { .. } => STARTUP_FAILURE_CODE,
        ExceptionRecord::Timeout { .. } => TIMEOUT_CODE,
    };
    let marker = |prefix: &str, value: &str| {
        TaggedResult::new(format!("{prefix}{value}"), ResultValue::Int(0))
    };
    [
        TaggedResult::new(exit_tag(record.message()), ResultValue::Int(code)),
        marker(EXCEPTION_TYPE_PREFIX, record.kind().as_str()),
        marker(STDERR_PREFIX, &stderr_file.display().to_string()),
        marker(STDOUT_PREFIX, &stdout_file.display().to_string()),
    ]
}

/// Whether any entry carries a tag in one of the exception metadata namespaces.
pub fn has_exception_metadata(entries: &[TaggedResult]) -> bool {
    entries.iter().any(|entry| {
        let tag = entry.tag.as_str();
        tag.starts_with(EXCEPTION_TYPE_PREFIX)
            || tag.starts_with(STDERR_PREFIX)
            || tag.starts_with(STDOUT_PREFIX)
    })
}

/// Whether any entry is an `EXIT` entry.
pub fn has_exit(entries: &[TaggedResult]) -> bool {
    entries.iter().any(|entry| entry.tag.starts_with(EXIT_PREFIX))
}

/// Reconstruct the exception encoded at the end of a shot, if any.
///
/// Returns `Ok(None)` when no `EXIT` entry is present. The only error is
/// an unknown exception kind, which means producer and consumer disagree
/// about the protocol.
pub fn decode_exception(entries: &[TaggedResult]) -> EngineResult<Option<ExceptionRecord>> {
    if !has_exit(entries) {
        return Ok(None);
    }

    let mut exit: Option<(&str, Option<i64>)> = None;
    let mut kind: Option<&str> = None;
    let mut stderr_path: Option<&str> = None;
    let mut stdout_path: Option<&str> = None;

    for entry in entries.iter().rev() {
        let tag = entry.tag.as_str();
        if let Some(message) = tag.strip_prefix(EXIT_PREFIX) {
            exit.get_or_insert((message, entry.value.as_int()));
        } else if let Some(name) = tag.strip_prefix(EXCEPTION_TYPE_PREFIX) {
            kind.get_or_insert(name);
        } else if let Some(path) = tag.strip_prefix(STDERR_PREFIX) {
            stderr_path.get_or_insert(path);
        } else if let Some(path) = tag.strip_prefix(STDOUT_PREFIX) {
            stdout_path.get_or_insert(path);
        }
    }

    let stdout = read_captured(stdout_path, CORRUPTED_STDOUT);
    let stderr = read_captured(stderr_path, CORRUPTED_STDERR);

    let mut missing = Vec::new();
    match exit {
        None => missing.push("error message"),
        Some((_, None)) => missing.push("error code"),
        Some(_) => {}
    }
    if kind.is_none() {
        missing.push("exception type");
    }
    if stderr_path.is_none() {
        missing.push("stderr path");
    }
    if stdout_path.is_none() {
        missing.push("stdout path");
    }

    let (Some((message, Some(code))), Some(kind)) = (exit, kind) else {
        return Ok(Some(incomplete(exit.map(|(m, _)| m), &missing, stdout, stderr)));
    };
    if !missing.is_empty() {
        return Ok(Some(incomplete(Some(message), &missing, stdout, stderr)));
    }

    let kind = ExceptionKind::from_wire(kind)
        .ok_or_else(|| EngineError::Protocol(format!("unknown exception type {kind:?}")))?;
    Ok(Some(ExceptionRecord::new(
        kind, message, code, stdout, stderr,
    )))
}

fn incomplete(
    message: Option<&str>,
    missing: &[&str],
    stdout: String,
    stderr: String,
) -> ExceptionRecord {
    let mut text = format!(
        "Incomplete exception encoding in shot results: missing {}",
        missing.join(", ")
    );
    if let Some(message) = message {
        text.push_str(&format!("; error message: {message}"));
    }
    ExceptionRecord::RuntimeFailure {
        message: text,
        stdout,
        stderr,
    }
}

fn read_captured(path: Option<&str>, placeholder: &str) -> String {
    path.and_then(|path| std::fs::read_to_string(path).ok())
        .unwrap_or_else(|| placeholder.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Captured {
        _dir: tempfile::TempDir,
        stdout: std::path::PathBuf,
        stderr: std::path::PathBuf,
    }

    fn captured() -> Captured {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout.log");
        let stderr = dir.path().join("stderr.log");
        std::fs::write(&stdout, "hello from the program\n").unwrap();
        std::fs::write(&stderr, "something went wrong\n").unwrap();
        Captured {
            _dir: dir,
            stdout,
            stderr,
        }
    }

    fn user(name: &str) -> TaggedResult {
        TaggedResult::new(format!("USER:BOOL:{name}"), ResultValue::Bool(true))
    }

    #[test]
    fn test_round_trip_every_kind() {
        let files = captured();
        for kind in [
            ExceptionKind::Panic,
            ExceptionKind::RuntimeFailure,
            ExceptionKind::StartupFailure,
            ExceptionKind::Timeout,
        ] {
            let original = ExceptionRecord::new(
                kind,
                "Postselection failed",
                1001,
                "hello from the program\n",
                "something went wrong\n",
            );
            let mut entries = vec![user("c0")];
            entries.extend(encode_exception(&original, &files.stdout, &files.stderr));

            let decoded = decode_exception(&entries).unwrap().unwrap();
            assert_eq!(decoded, original, "{kind}");
        }
    }

    #[test]
    fn test_encoding_shape() {
        let files = captured();
        let record = ExceptionRecord::new(ExceptionKind::Timeout, "slow", 0, "", "");
        let entries = encode_exception(&record, &files.stdout, &files.stderr);
        assert_eq!(entries[0].tag, "EXIT:INT:slow");
        assert_eq!(entries[0].value, ResultValue::Int(TIMEOUT_CODE));
        assert_eq!(entries[1].tag, "_EXCEPTION:INT:Timeout");
        assert!(entries[2].tag.starts_with(STDERR_PREFIX));
        assert!(entries[3].tag.starts_with(STDOUT_PREFIX));
    }

    #[test]
    fn test_panic_code_passes_through() {
        let files = captured();
        let record = ExceptionRecord::new(ExceptionKind::Panic, "EXIT:INT:boom", 42, "", "");
        let entries = encode_exception(&record, &files.stdout, &files.stderr);
        assert_eq!(entries[0].tag, "EXIT:INT:boom");
        assert_eq!(entries[0].value, ResultValue::Int(42));
    }

    #[test]
    fn test_no_exit_means_no_exception() {
        let entries = vec![user("a"), user("b")];
        assert_eq!(decode_exception(&entries).unwrap(), None);
        assert_eq!(decode_exception(&[]).unwrap(), None);
    }

    #[test]
    fn test_interleaved_metrics_are_tolerated() {
        let files = captured();
        let record = ExceptionRecord::new(ExceptionKind::Panic, "boom", 5, "", "");
        let [exit, kind, stderr, stdout] = encode_exception(&record, &files.stdout, &files.stderr);
        let metric = TaggedResult::new("METRICS:INT:user_program:qalloc_count", ResultValue::Int(1));
        let entries = vec![
            exit,
            metric.clone(),
            kind,
            metric.clone(),
            stderr,
            stdout,
            metric,
        ];
        let decoded = decode_exception(&entries).unwrap().unwrap();
        assert_eq!(decoded.kind(), ExceptionKind::Panic);
        assert_eq!(decoded.code(), Some(5));
    }

    #[test]
    fn test_truncated_tail_falls_back_to_runtime_failure() {
        let files = captured();
        let record = ExceptionRecord::new(ExceptionKind::Panic, "boom", 5, "", "");
        let entries = encode_exception(&record, &files.stdout, &files.stderr);

        // killed after the stderr marker was written
        let decoded = decode_exception(&entries[..3]).unwrap().unwrap();
        assert_eq!(decoded.kind(), ExceptionKind::RuntimeFailure);
        assert!(decoded.message().contains("missing stdout path"));
        assert!(decoded.message().contains("boom"));
        assert_eq!(decoded.stdout(), CORRUPTED_STDOUT);
        assert_eq!(decoded.stderr(), "something went wrong\n");

        let decoded = decode_exception(&entries[..1]).unwrap().unwrap();
        assert!(
            decoded
                .message()
                .contains("missing exception type, stderr path, stdout path")
        );
        assert_eq!(decoded.stderr(), CORRUPTED_STDERR);
    }

    #[test]
    fn test_unreadable_file_uses_placeholder() {
        let entries = vec![
            TaggedResult::new("EXIT:INT:boom", ResultValue::Int(1)),
            TaggedResult::new("_EXCEPTION:INT:Panic", ResultValue::Int(0)),
            TaggedResult::new("_STDERR:INT:/nonexistent/stderr.log", ResultValue::Int(0)),
            TaggedResult::new("_STDOUT:INT:/nonexistent/stdout.log", ResultValue::Int(0)),
        ];
        let decoded = decode_exception(&entries).unwrap().unwrap();
        assert_eq!(decoded.kind(), ExceptionKind::Panic);
        assert_eq!(decoded.stdout(), CORRUPTED_STDOUT);
        assert_eq!(decoded.stderr(), CORRUPTED_STDERR);
    }

    #[test]
    fn test_unknown_kind_is_protocol_error() {
        let entries = vec![
            TaggedResult::new("EXIT:INT:boom", ResultValue::Int(1)),
            TaggedResult::new("_EXCEPTION:INT:SegFault", ResultValue::Int(0)),
            TaggedResult::new("_STDERR:INT:/tmp/e", ResultValue::Int(0)),
            TaggedResult::new("_STDOUT:INT:/tmp/o", ResultValue::Int(0)),
        ];
        assert!(matches!(
            decode_exception(&entries),
            Err(EngineError::Protocol(_))
        ));
    }
}
