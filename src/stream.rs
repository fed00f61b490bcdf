//! Result-stream wire format.
//!
//! Workers write one entry per line:
//!
//! ```text
//!   NAMESPACE:TYPE:NAME<TAB>VALUE
//!   USER:BOOL:c0	1
//!   USER:FLOATARR:angles	0.5,0.25
//!   METRICS:INT:user_program:qalloc_count	4
//!   USER:INT:__SHOT_BOUNDARY__	0
//! ```
//!
//! `NAME` may contain `:`. A shot ends at the boundary entry, which is
//! consumed by the reader and never shown to callers.
//!
//! [`ResultStreamReader`] is the consumer side, [`ResultStreamWriter`] the
//! producer side used by workers.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{EngineError, EngineResult};

/// Separator between tag and value on a line.
pub const SEPARATOR: char = '\t';

/// Tag of the entry that ends every shot.
pub const SHOT_BOUNDARY_TAG: &str = "USER:INT:__SHOT_BOUNDARY__";

/// Type component of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    BoolArray,
    IntArray,
    FloatArray,
    String,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "BOOL",
            ValueType::Int => "INT",
            ValueType::Float => "FLOAT",
            ValueType::BoolArray => "BOOLARR",
            ValueType::IntArray => "INTARR",
            ValueType::FloatArray => "FLOATARR",
            ValueType::String => "STRING",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "BOOL" => ValueType::Bool,
            "INT" => ValueType::Int,
            "FLOAT" => ValueType::Float,
            "BOOLARR" => ValueType::BoolArray,
            "INTARR" => ValueType::IntArray,
            "FLOATARR" => ValueType::FloatArray,
            "STRING" => ValueType::String,
            _ => return None,
        })
    }
}

/// Namespace component of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Results declared by the program.
    User,
    /// Counters and timers contributed by pipeline stages.
    Metrics,
    /// Explicit termination with a message and code.
    Exit,
    /// Exception kind marker.
    Exception,
    /// Path of the captured stderr file.
    Stderr,
    /// Path of the captured stdout file.
    Stdout,
    /// Anything else; passed through verbatim when results are unparsed.
    Other(String),
}

impl Namespace {
    pub fn as_str(&self) -> &str {
        match self {
            Namespace::User => "USER",
            Namespace::Metrics => "METRICS",
            Namespace::Exit => "EXIT",
            Namespace::Exception => "_EXCEPTION",
            Namespace::Stderr => "_STDERR",
            Namespace::Stdout => "_STDOUT",
            Namespace::Other(name) => name,
        }
    }

    fn from_wire(name: &str) -> Self {
        match name {
            "USER" => Namespace::User,
            "METRICS" => Namespace::Metrics,
            "EXIT" => Namespace::Exit,
            "_EXCEPTION" => Namespace::Exception,
            "_STDERR" => Namespace::Stderr,
            "_STDOUT" => Namespace::Stdout,
            other => Namespace::Other(other.to_string()),
        }
    }

    /// The three namespaces reserved for exception metadata.
    pub fn is_exception_metadata(&self) -> bool {
        matches!(
            self,
            Namespace::Exception | Namespace::Stderr | Namespace::Stdout
        )
    }
}

/// A parsed `NAMESPACE:TYPE:NAME` tag, borrowing from the raw tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag<'a> {
    pub namespace: Namespace,
    pub value_type: ValueType,
    pub name: &'a str,
}

impl<'a> Tag<'a> {
    pub fn parse(raw: &'a str) -> EngineResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let (Some(namespace), Some(value_type), Some(name)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(EngineError::Protocol(format!(
                "malformed tag {raw:?}: expected NAMESPACE:TYPE:NAME"
            )));
        };
        let value_type = ValueType::from_wire(value_type).ok_or_else(|| {
            EngineError::Protocol(format!("unknown value type {value_type:?} in tag {raw:?}"))
        })?;
        Ok(Self {
            namespace: Namespace::from_wire(namespace),
            value_type,
            name,
        })
    }
}

/// Value of a result entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    String(String),
}

impl ResultValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ResultValue::Bool(_) => ValueType::Bool,
            ResultValue::Int(_) => ValueType::Int,
            ResultValue::Float(_) => ValueType::Float,
            ResultValue::BoolArray(_) => ValueType::BoolArray,
            ResultValue::IntArray(_) => ValueType::IntArray,
            ResultValue::FloatArray(_) => ValueType::FloatArray,
            ResultValue::String(_) => ValueType::String,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ResultValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ResultValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Decode a raw value according to its declared type.
    pub fn parse(value_type: ValueType, raw: &str) -> EngineResult<Self> {
        let bad = |what: &str| {
            EngineError::Protocol(format!(
                "invalid {} value {raw:?}: {what}",
                value_type.as_str()
            ))
        };
        Ok(match value_type {
            ValueType::Bool => ResultValue::Bool(parse_bool(raw).ok_or_else(|| bad("not 0/1"))?),
            ValueType::Int => {
                ResultValue::Int(raw.parse::<i64>().map_err(|e| bad(&format!("{e}")))?)
            }
            ValueType::Float => {
                ResultValue::Float(raw.parse::<f64>().map_err(|e| bad(&format!("{e}")))?)
            }
            ValueType::BoolArray => ResultValue::BoolArray(
                split_array(raw)
                    .map(|item| parse_bool(item).ok_or_else(|| bad("element not 0/1")))
                    .collect::<EngineResult<_>>()?,
            ),
            ValueType::IntArray => ResultValue::IntArray(
                split_array(raw)
                    .map(|item| item.parse::<i64>().map_err(|e| bad(&format!("{e}"))))
                    .collect::<EngineResult<_>>()?,
            ),
            ValueType::FloatArray => ResultValue::FloatArray(
                split_array(raw)
                    .map(|item| item.parse::<f64>().map_err(|e| bad(&format!("{e}"))))
                    .collect::<EngineResult<_>>()?,
            ),
            ValueType::String => ResultValue::String(raw.to_string()),
        })
    }

    /// Encode for the wire.
    pub fn to_wire(&self) -> String {
        fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
            items.map(|item| item.to_string()).collect::<Vec<_>>().join(",")
        }
        match self {
            ResultValue::Bool(v) => u8::from(*v).to_string(),
            ResultValue::Int(v) => v.to_string(),
            ResultValue::Float(v) => v.to_string(),
            ResultValue::BoolArray(v) => join(v.iter().map(|b| u8::from(*b))),
            ResultValue::IntArray(v) => join(v.iter()),
            ResultValue::FloatArray(v) => join(v.iter()),
            ResultValue::String(v) => v.replace(['\n', '\r'], " "),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "0" | "false" => Some(false),
        "1" | "true" => Some(true),
        _ => None,
    }
}

fn split_array(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').filter(|item| !item.is_empty())
}

/// One `(tag, value)` unit of a shot's output, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedResult {
    pub tag: String,
    pub value: ResultValue,
}

impl TaggedResult {
    pub fn new(tag: impl Into<String>, value: ResultValue) -> Self {
        Self {
            tag: tag.into(),
            value,
        }
    }

    pub fn parsed_tag(&self) -> EngineResult<Tag<'_>> {
        Tag::parse(&self.tag)
    }

    pub fn is_shot_boundary(&self) -> bool {
        self.tag == SHOT_BOUNDARY_TAG
    }
}

/// Decode one complete line (without its newline).
pub fn parse_line(line: &str) -> EngineResult<TaggedResult> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (tag, raw) = line.split_once(SEPARATOR).ok_or_else(|| {
        EngineError::Protocol(format!("malformed entry {line:?}: missing separator"))
    })?;
    let value = ResultValue::parse(Tag::parse(tag)?.value_type, raw)?;
    Ok(TaggedResult::new(tag, value))
}

/// Encode one entry as a line, including its newline.
pub fn format_line(tag: &str, value: &ResultValue) -> String {
    let tag = tag.replace([SEPARATOR, '\n', '\r'], " ");
    format!("{tag}{SEPARATOR}{}\n", value.to_wire())
}

/// What the reader produced next.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Entry(TaggedResult),
    ShotBoundary,
    /// The worker closed the stream. `truncated` is set when a final
    /// partial line was discarded.
    EndOfStream { truncated: bool },
}

/// Consumer side of one worker's result stream.
pub struct ResultStreamReader<R> {
    inner: R,
    line: String,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> ResultStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read the next event. Once the end of stream has been returned,
    /// every later call returns it again.
    pub async fn next_event(&mut self) -> EngineResult<StreamEvent> {
        if self.finished {
            return Ok(StreamEvent::EndOfStream { truncated: false });
        }
        self.line.clear();
        let n = match self.inner.read_line(&mut self.line).await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                // non-UTF-8 bytes: the stream is beyond repair
                return Err(EngineError::Protocol(format!("result stream: {e}")));
            }
            Err(e) if is_disconnect(&e) => {
                self.finished = true;
                return Ok(StreamEvent::EndOfStream { truncated: false });
            }
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            self.finished = true;
            return Ok(StreamEvent::EndOfStream { truncated: false });
        }
        let Some(line) = self.line.strip_suffix('\n') else {
            trace!(target: "shot_engine::stream", partial = %self.line, "discarding partial line");
            self.finished = true;
            return Ok(StreamEvent::EndOfStream { truncated: true });
        };
        let entry = parse_line(line)?;
        if entry.is_shot_boundary() {
            Ok(StreamEvent::ShotBoundary)
        } else {
            Ok(StreamEvent::Entry(entry))
        }
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Producer side of a result stream.
pub struct ResultStreamWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ResultStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write(&mut self, tag: &str, value: &ResultValue) -> std::io::Result<()> {
        self.inner
            .write_all(format_line(tag, value).as_bytes())
            .await
    }

    pub async fn write_entry(&mut self, entry: &TaggedResult) -> std::io::Result<()> {
        self.write(&entry.tag, &entry.value).await
    }

    /// Write `USER:<TYPE>:<name>`.
    pub async fn write_user(&mut self, name: &str, value: &ResultValue) -> std::io::Result<()> {
        let tag = format!("USER:{}:{name}", value.value_type().as_str());
        self.write(&tag, value).await
    }

    /// Write `METRICS:<TYPE>:<category>:<name>`.
    pub async fn write_metric(
        &mut self,
        category: &str,
        name: &str,
        value: &ResultValue,
    ) -> std::io::Result<()> {
        let tag = format!("METRICS:{}:{category}:{name}", value.value_type().as_str());
        self.write(&tag, value).await
    }

    /// Write a benign `EXIT` entry: ends the shot, not the run.
    pub async fn write_exit(&mut self, message: &str, code: i64) -> std::io::Result<()> {
        self.write(&crate::exception::exit_tag(message), &ResultValue::Int(code))
            .await
    }

    pub async fn end_shot(&mut self) -> std::io::Result<()> {
        self.write(SHOT_BOUNDARY_TAG, &ResultValue::Int(0)).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
