use std::fmt::Write;

use serde_json::Value;

use crate::ports::log_sink::{Fields, LogRecord, LogSink, Severity};

/// Default [`LogSink`]: one `tracing` event per record under target `httplog`.
///
/// Fields are rendered as `key="value"` pairs in arrival order; the
/// call-stack, when present, goes in a separate `callstack` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

impl LogSink for TracingSink {
    fn emit(&self, record: LogRecord) {
        let fields = render_fields(&record.fields);
        let callstack = record
            .call_stack
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let message = record.message;

        match record.severity {
            Severity::Info => {
                tracing::info!(target: "httplog", fields = %fields, callstack = %callstack, "{}", message)
            }
            Severity::Warn => {
                tracing::warn!(target: "httplog", fields = %fields, callstack = %callstack, "{}", message)
            }
            Severity::Error => {
                tracing::error!(target: "httplog", fields = %fields, callstack = %callstack, "{}", message)
            }
        }
    }
}

/// `key="value"` pairs separated by spaces; strings are quoted and escaped.
pub fn render_fields(fields: &Fields) -> String {
    let mut rendered = String::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            rendered.push(' ');
        }
        let _ = match value {
            Value::String(s) => write!(rendered, "{key}={s:?}"),
            other => write!(rendered, "{key}=\"{other}\""),
        };
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{CallStack, Frame};

    #[test]
    fn test_render_fields() {
        let fields: Fields = [
            ("method", Value::from("GET")),
            ("http_status", Value::from(200)),
            ("note", Value::from("say \"hi\"")),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            render_fields(&fields),
            r#"method="GET" http_status="200" note="say \"hi\"""#
        );
    }

    #[test]
    fn test_emit_every_severity() {
        let sink = TracingSink::new();
        for severity in [Severity::Info, Severity::Warn, Severity::Error] {
            let mut record = LogRecord::new(severity, "OK").with_field("uri", "/");
            record.call_stack = Some(CallStack::from_frames(vec![Frame {
                file: "src/main.rs".to_string(),
                line: 1,
                function: None,
            }]));
            sink.emit(record);
        }
    }
}
