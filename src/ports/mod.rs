pub mod log_sink;
pub mod resolver;

pub use log_sink::{Fields, LogRecord, LogSink, Severity};
pub use resolver::{ResolveError, ReverseResolver};
