//! Error aggregation for request logging.
//!
//! A request can accumulate failures from several places: the handler itself,
//! a recovered panic, body serialization, gzip transcoding, or the write to the
//! client. [`ReportableError`] folds them into a single loggable unit that
//! keeps every message (in the order they were observed) and the call-stack
//! captured closest to the failure.
use std::{fmt, path::Path};

use thiserror::Error;

/// Kinds of failure that can end up in a request's log record.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestError {
    /// Request arrived after shutdown began
    #[error("server shutting down")]
    ShuttingDown,

    /// Error reported by the application handler
    #[error("{0}")]
    Handler(String),

    /// Panic recovered from the handler or the dispatcher
    #[error("panic: {0}")]
    Panic(String),

    /// Response body could not be serialized to JSON
    #[error("json serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Response body could not be gzip encoded or decoded
    #[error("gzip transcoding: {0}")]
    Transcode(#[source] std::io::Error),

    /// The transport stopped pulling the body before it was fully written
    #[error("write: client went away after {sent} of {total} bytes")]
    Write { sent: usize, total: usize },

    /// The request was dropped before the handler produced a response
    #[error("request cancelled before a response was produced")]
    Cancelled,
}

/// One call site of a captured stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "{}:{}:{}", self.file, function, self.line),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

/// Ordered call-site frames, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
    frames: Vec<Frame>,
}

/// Symbol prefixes that belong to the runtime rather than application code.
const SKIPPED_SYMBOL_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "backtrace::",
    "tokio::",
    "futures_util::",
    "__rust",
    "rust_begin_unwind",
    "rust_panic",
    "httplog::core::panic::",
    "httplog::core::error::CallStack::",
];

impl CallStack {
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Capture the current thread's stack.
    pub fn capture() -> Self {
        Self::from_backtrace(&backtrace::Backtrace::new())
    }

    /// Build a stack from a previously captured backtrace, resolving symbols
    /// if needed.
    pub fn from_backtrace(trace: &backtrace::Backtrace) -> Self {
        let mut frames = Vec::new();
        for frame in trace.frames() {
            for symbol in frame.symbols() {
                let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) else {
                    continue;
                };
                let function = symbol.name().map(|name| format!("{name:#}"));
                if function
                    .as_deref()
                    .is_some_and(|name| SKIPPED_SYMBOL_PREFIXES.iter().any(|p| name.starts_with(p)))
                {
                    continue;
                }
                if is_toolchain_path(file) {
                    continue;
                }
                frames.push(Frame {
                    file: shorten_path(file),
                    line,
                    function,
                });
            }
        }
        Self { frames }
    }

    /// Put `frame` at the innermost position unless it is already there.
    pub fn push_innermost(&mut self, frame: Frame) {
        let duplicate = self
            .frames
            .first()
            .is_some_and(|first| first.file == frame.file && first.line == frame.line);
        if !duplicate {
            self.frames.insert(0, frame);
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}

fn is_toolchain_path(path: &Path) -> bool {
    let path = path.to_string_lossy();
    path.starts_with("/rustc/") || path.contains("/.cargo/registry/") || path.contains("/rustlib/")
}

/// Keep only the last two components of a source path (`core/server.rs`).
pub(crate) fn shorten_path(path: &Path) -> String {
    let components: Vec<_> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let start = components.len().saturating_sub(2);
    components[start..].join("/")
}

/// The unit of failure information attached to one request's log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportableError {
    message: String,
    call_stack: Option<CallStack>,
}

impl ReportableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            call_stack: None,
        }
    }

    /// Error from a handler-returned report; the whole cause chain is kept.
    pub fn from_report(report: &eyre::Report) -> Self {
        Self::new(format!("{report:#}"))
    }

    pub fn with_call_stack(mut self, call_stack: CallStack) -> Self {
        self.call_stack = Some(call_stack);
        self
    }

    /// Attach the current stack unless one is already present.
    pub fn capture_call_stack(mut self) -> Self {
        if self.call_stack.is_none() {
            self.call_stack = Some(CallStack::capture());
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn call_stack(&self) -> Option<&CallStack> {
        self.call_stack.as_ref()
    }

    /// Combine with a later error.
    ///
    /// Messages are joined `earlier - later`; the later error's stack wins
    /// when it has one, since it was captured nearer the latest failure.
    pub fn merge(self, later: ReportableError) -> ReportableError {
        ReportableError {
            message: format!("{} - {}", self.message, later.message),
            call_stack: later.call_stack.or(self.call_stack),
        }
    }

    /// Fold `later` into an optional earlier error.
    pub fn combine(earlier: Option<ReportableError>, later: ReportableError) -> ReportableError {
        match earlier {
            Some(earlier) => earlier.merge(later),
            None => later,
        }
    }
}

impl From<RequestError> for ReportableError {
    fn from(err: RequestError) -> Self {
        ReportableError::new(err.to_string())
    }
}

impl fmt::Display for ReportableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ReportableError {}
