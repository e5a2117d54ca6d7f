use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::{
    core::error::{CallStack, ReportableError},
    ports::log_sink::Fields,
};

#[derive(Debug, Default)]
struct Accumulated {
    fields: Fields,
    error: Option<ReportableError>,
    call_stack: Option<CallStack>,
}

/// Request-scoped log accumulator handed to handlers.
///
/// Clones share the same record, so fields added before a panic survive it.
/// The wrapper emits the record exactly once after the response is written.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    inner: Arc<Mutex<Accumulated>>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Accumulated> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_field(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.lock().fields.insert(key, value);
    }

    pub fn add_fields<K, V>(&self, fields: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut inner = self.lock();
        for (key, value) in fields {
            inner.fields.insert(key, value);
        }
    }

    /// Attach the caller's current call-stack to the record.
    pub fn add_call_stack(&self) {
        let stack = CallStack::capture();
        self.lock().call_stack = Some(stack);
    }

    /// Record an error without changing the response.
    ///
    /// Several recorded errors are merged in the order they were recorded.
    pub fn record_error(&self, error: impl Into<eyre::Report>) {
        let error = ReportableError::from_report(&error.into());
        let mut inner = self.lock();
        let merged = ReportableError::combine(inner.error.take(), error);
        inner.error = Some(merged);
    }

    pub fn field(&self, key: &str) -> Option<Value> {
        self.lock().fields.get(key).cloned()
    }

    /// Take everything accumulated so far, leaving the log empty.
    pub(crate) fn take(&self) -> (Fields, Option<ReportableError>, Option<CallStack>) {
        let mut inner = self.lock();
        let taken = std::mem::take(&mut *inner);
        (taken.fields, taken.error, taken.call_stack)
    }
}
