//! Transport adapter: a `tower::Service` around one named handler.
//!
//! The response body is a [`LoggedBody`] that hands the resolved bytes to
//! the transport in fixed-size chunks. When the body is dropped (fully
//! written or abandoned) it releases the request's gate slot, records
//! metrics and emits the request's single log record. A request dropped
//! before its response exists is logged as cancelled.
use std::{
    convert::Infallible,
    fmt,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::extract::ConnectInfo;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};
use http_body::{Frame, SizeHint};
use serde_json::Value;
use tower::Service;
use tracing::Instrument;

use crate::{
    adapters::hostname_cache::HostnameCache,
    core::{
        error::{CallStack, ReportableError, RequestError},
        request_log::RequestLog,
        server::{LoggedHandler, Server},
    },
    metrics,
    ports::log_sink::{Fields, LogRecord, LogSink, Severity},
    tracing_setup::create_request_span,
    utils::connection_gate::InFlight,
};

/// Largest frame handed to the transport in one poll.
pub const WRITE_CHUNK_SIZE: usize = 8 * 1024;

/// A named handler bound to a [`Server`].
#[derive(Clone)]
pub struct LoggedService {
    server: Server,
    name: Arc<str>,
    handler: Arc<dyn LoggedHandler>,
}

impl LoggedService {
    pub(crate) fn new(server: Server, name: String, handler: Arc<dyn LoggedHandler>) -> Self {
        Self {
            server,
            name: name.into(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LoggedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggedService")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<B> Service<http::Request<B>> for LoggedService
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    type Response = http::Response<LoggedBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let started = Instant::now();
        let server = self.server.clone();
        let handler = self.handler.clone();
        let meta = RequestMeta::from_request(&request, self.name.clone());
        let span = create_request_span(meta.method.as_str(), request.uri().path(), &self.name);

        Box::pin(
            async move {
                let Some(permit) = server.gate().try_enter() else {
                    let mut finalizer = Finalizer::new(meta, &server, started, None);
                    finalizer.status = StatusCode::SERVICE_UNAVAILABLE;
                    finalizer.error = Some(RequestError::ShuttingDown.into());
                    tracing::Span::current().record("http.status_code", 503);
                    return Ok(finalizer.into_response(HeaderMap::new(), Bytes::new()));
                };

                // From here on the request is logged even if this future is
                // dropped before the handler returns.
                let mut finalizer = Finalizer::new(meta, &server, started, Some(permit));
                let request = request.map(axum::body::Body::new);
                let handled = server
                    .run_handler(handler.as_ref(), request, finalizer.log.clone())
                    .await;
                let dispatched = handled.dispatched;
                tracing::Span::current().record("http.status_code", dispatched.status.as_u16());

                finalizer.status = dispatched.status;
                finalizer.fields = handled.fields;
                finalizer.error = handled.error;
                finalizer.call_stack = handled.call_stack;
                Ok(finalizer.into_response(dispatched.headers, dispatched.body))
            }
            .instrument(span),
        )
    }
}

#[derive(Debug, Clone)]
struct RequestMeta {
    handler: Arc<str>,
    method: Method,
    uri: String,
    remote_addr: Option<SocketAddr>,
}

impl RequestMeta {
    fn from_request<B>(request: &http::Request<B>, handler: Arc<str>) -> Self {
        Self {
            handler,
            method: request.method().clone(),
            uri: request.uri().to_string(),
            remote_addr: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        }
    }
}

/// Everything needed to emit the request's record once the body is done.
///
/// Emits exactly once: from [`LoggedBody`] when the body is dropped, or from
/// its own drop when the request is abandoned before a response exists.
struct Finalizer {
    meta: RequestMeta,
    sink: Arc<dyn LogSink>,
    hostnames: Option<Arc<HostnameCache>>,
    log: RequestLog,
    status: StatusCode,
    fields: Fields,
    error: Option<ReportableError>,
    call_stack: Option<CallStack>,
    started: Instant,
    permit: Option<InFlight>,
    emitted: bool,
}

impl Finalizer {
    fn new(meta: RequestMeta, server: &Server, started: Instant, permit: Option<InFlight>) -> Self {
        Self {
            meta,
            sink: server.sink().clone(),
            hostnames: server.hostnames().cloned(),
            log: RequestLog::new(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            fields: Fields::new(),
            error: None,
            call_stack: None,
            started,
            permit,
            emitted: false,
        }
    }

    fn into_response(self, headers: HeaderMap, body: Bytes) -> http::Response<LoggedBody> {
        let status = self.status;
        let mut response = http::Response::new(LoggedBody {
            total: body.len(),
            remaining: body,
            sent: 0,
            finalizer: self,
        });
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    fn finish(&mut self, sent: usize, total: usize, complete: bool) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        let elapsed = self.started.elapsed();

        // HEAD responses are never polled for their body.
        if !complete && self.meta.method != Method::HEAD {
            let write_error = RequestError::Write { sent, total }.into();
            self.error = Some(ReportableError::combine(self.error.take(), write_error));
        }

        metrics::record_request(
            self.status.as_u16(),
            &self.meta.handler,
            self.meta.method.as_str(),
            elapsed,
            sent,
        );
        drop(self.permit.take());

        let pending = PendingEmit {
            sink: self.sink.clone(),
            record: Some(self.build_record(sent, elapsed)),
        };
        let remote_ip = self.meta.remote_addr.map(|addr| addr.ip());

        match (self.hostnames.take(), remote_ip, tokio::runtime::Handle::try_current()) {
            (Some(cache), Some(ip), Ok(runtime)) => {
                // The reverse lookup may block. A task the runtime never runs
                // still emits on drop, without `remote_host`.
                runtime.spawn_blocking(move || {
                    let mut pending = pending;
                    if let Some(record) = pending.record.as_mut() {
                        record.fields.insert("remote_host", cache.lookup(ip));
                    }
                });
            }
            _ => drop(pending),
        }
    }

    fn build_record(&mut self, sent: usize, elapsed: Duration) -> LogRecord {
        let message = match &self.error {
            Some(error) => error.message().to_string(),
            None => self
                .status
                .canonical_reason()
                .unwrap_or(self.status.as_str())
                .to_string(),
        };

        let mut fields = std::mem::take(&mut self.fields);
        fields.insert("bytes_sent", sent);
        fields.insert("http_status", self.status.as_u16());
        fields.insert("method", self.meta.method.as_str());
        fields.insert(
            "remote_addr",
            self.meta
                .remote_addr
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
        );
        fields.insert(
            "time_taken",
            Value::from(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
        );
        fields.insert("uri", self.meta.uri.as_str());
        fields.insert("handler", &*self.meta.handler);

        let call_stack = self
            .error
            .as_ref()
            .and_then(|error| error.call_stack().cloned())
            .or_else(|| self.call_stack.take());

        LogRecord {
            severity: Severity::from_status(self.status.as_u16()),
            message,
            fields,
            call_stack,
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if self.emitted {
            return;
        }
        // Dropped before a response existed: client gone or listener aborted.
        let (fields, recorded, call_stack) = self.log.take();
        self.status = StatusCode::INTERNAL_SERVER_ERROR;
        self.fields = fields;
        self.error = Some(ReportableError::combine(recorded, RequestError::Cancelled.into()));
        self.call_stack = call_stack;
        self.finish(0, 0, true);
    }
}

/// A built record that is emitted when dropped.
struct PendingEmit {
    sink: Arc<dyn LogSink>,
    record: Option<LogRecord>,
}

impl Drop for PendingEmit {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.sink.emit(record);
        }
    }
}

/// Response body that reports how much of itself was written.
pub struct LoggedBody {
    remaining: Bytes,
    total: usize,
    sent: usize,
    finalizer: Finalizer,
}

impl LoggedBody {
    /// Bytes handed to the transport so far.
    pub fn bytes_sent(&self) -> usize {
        self.sent
    }
}

impl fmt::Debug for LoggedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggedBody")
            .field("total", &self.total)
            .field("sent", &self.sent)
            .finish_non_exhaustive()
    }
}

impl http_body::Body for LoggedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.remaining.is_empty() {
            return Poll::Ready(None);
        }
        let len = this.remaining.len().min(WRITE_CHUNK_SIZE);
        let chunk = this.remaining.split_to(len);
        this.sent += chunk.len();
        Poll::Ready(Some(Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.remaining.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining.len() as u64)
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        let complete = self.remaining.is_empty();
        self.finalizer.finish(self.sent, self.total, complete);
    }
}
