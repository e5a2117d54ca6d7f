//! The request wrapper and its lifecycle.
//!
//! [`Server`] owns the shared pieces (gate, sink, dispatcher, optional
//! hostname cache) and wraps named [`LoggedHandler`]s into transport-level
//! services. Per request it runs the handler under panic recovery, folds every
//! failure into one [`ReportableError`] and dispatches the response; the
//! transport adapter emits the log record once the body has been written.
use std::{future::Future, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};

use crate::{
    adapters::{hostname_cache::HostnameCache, logged_service::LoggedService, tracing_sink::TracingSink},
    config::models::ServerConfig,
    core::{
        dispatcher::{Dispatched, Dispatcher},
        error::{CallStack, ReportableError},
        panic::{Recover, recover},
        request_log::RequestLog,
        response::Response,
    },
    ports::log_sink::{Fields, LogSink},
    utils::{
        connection_gate::ConnectionGate,
        graceful_shutdown::{ShutdownOutcome, ShutdownSequencer},
    },
};

/// Request type handed to handlers.
pub type Request = http::Request<axum::body::Body>;

pub type HandlerFuture = BoxFuture<'static, eyre::Result<Response>>;

/// An application handler.
///
/// Returning `Err` answers 500 with an empty body and logs the error chain.
/// To log an error while still choosing the response, use
/// [`Response::with_error`] or [`RequestLog::record_error`].
pub trait LoggedHandler: Send + Sync + 'static {
    fn call(&self, request: Request, log: RequestLog) -> HandlerFuture;
}

impl<F, Fut> LoggedHandler for F
where
    F: Fn(Request, RequestLog) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<Response>> + Send + 'static,
{
    fn call(&self, request: Request, log: RequestLog) -> HandlerFuture {
        Box::pin(self(request, log))
    }
}

/// Everything known about an admitted request once its response is resolved.
#[derive(Debug)]
pub(crate) struct Handled {
    pub dispatched: Dispatched,
    pub error: Option<ReportableError>,
    pub fields: Fields,
    pub call_stack: Option<CallStack>,
}

#[derive(Clone)]
pub struct Server {
    gate: Arc<ConnectionGate>,
    sink: Arc<dyn LogSink>,
    hostnames: Option<Arc<HostnameCache>>,
    dispatcher: Arc<Dispatcher>,
    shutdown_timeout: Duration,
}

impl Server {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            gate: Arc::new(ConnectionGate::new()),
            sink: Arc::new(TracingSink::new()),
            hostnames: None,
            dispatcher: Arc::new(Dispatcher::from(config)),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Send log records to `sink` instead of `tracing`.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Add a `remote_host` field resolved through `cache`. Records are then
    /// emitted from a blocking task.
    pub fn with_hostname_cache(mut self, cache: Arc<HostnameCache>) -> Self {
        self.hostnames = Some(cache);
        self
    }

    /// Wrap `handler` into a service; `name` labels its metrics and logs.
    pub fn handle(&self, name: impl Into<String>, handler: impl LoggedHandler) -> LoggedService {
        LoggedService::new(self.clone(), name.into(), Arc::new(handler))
    }

    /// Stop admitting requests without waiting. Idempotent.
    pub fn begin_shutdown(&self) -> bool {
        self.gate.begin_shutdown()
    }

    /// Stop admitting requests and wait, up to the configured deadline, for
    /// in-flight requests to finish.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        ShutdownSequencer::new(self.gate.clone(), self.sink.clone(), self.shutdown_timeout)
            .run()
            .await
    }

    pub fn open_connections(&self) -> usize {
        self.gate.open_count()
    }

    pub fn is_stopped(&self) -> bool {
        self.gate.is_stopped()
    }

    pub(crate) fn gate(&self) -> &Arc<ConnectionGate> {
        &self.gate
    }

    pub(crate) fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    pub(crate) fn hostnames(&self) -> Option<&Arc<HostnameCache>> {
        self.hostnames.as_ref()
    }

    /// Run `handler` for an admitted request and resolve its response.
    ///
    /// Never panics: panics from the handler or from body serialization
    /// become a 500 carrying the panic message and call-stack.
    ///
    /// `log` is handed to the handler and drained once it returns; clones
    /// held elsewhere see what was recorded if the request is abandoned.
    pub(crate) async fn run_handler(
        &self,
        handler: &dyn LoggedHandler,
        request: Request,
        log: RequestLog,
    ) -> Handled {
        let request_headers: HeaderMap = request.headers().clone();

        let outcome = match recover(|| handler.call(request, log.clone())) {
            Ok(future) => Recover::new(future).await,
            Err(report) => Err(report),
        };

        let (recorded_fields, recorded_error, explicit_stack) = log.take();
        let mut error = recorded_error;

        let response = match outcome {
            Ok(Ok(mut response)) => {
                if let Some(report) = response.error.take() {
                    error = Some(ReportableError::combine(error, ReportableError::from_report(&report)));
                }
                response
            }
            Ok(Err(report)) => {
                error = Some(ReportableError::combine(error, ReportableError::from_report(&report)));
                Response::empty().with_status(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Err(panic) => {
                tracing::debug!(message = %panic.message, "Recovered handler panic");
                error = Some(ReportableError::combine(error, panic.into()));
                Response::empty().with_status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };

        let dispatcher = &self.dispatcher;
        let mut dispatched = match recover(|| dispatcher.dispatch(response, &request_headers)) {
            Ok(dispatched) => dispatched,
            Err(panic) => {
                let dispatched = dispatcher.dispatch(
                    Response::empty().with_status(StatusCode::INTERNAL_SERVER_ERROR),
                    &request_headers,
                );
                error = Some(ReportableError::combine(error, panic.into()));
                dispatched
            }
        };
        if let Some(dispatch_error) = dispatched.error.take() {
            error = Some(ReportableError::combine(error, dispatch_error));
        }

        Handled {
            dispatched,
            error,
            fields: recorded_fields,
            call_stack: explicit_stack,
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("gate", &self.gate)
            .field("dispatcher", &self.dispatcher)
            .field("hostnames", &self.hostnames)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    use super::*;
    use crate::core::dispatcher::Encoding;

    fn server() -> Server {
        Server::new(&ServerConfig::default())
    }

    fn request() -> Request {
        http::Request::builder()
            .uri("/test")
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_handler() {
        let handler = |_req: Request, log: RequestLog| async move {
            log.add_field("user", "alice");
            Ok::<_, eyre::Report>(Response::text("hello").with_status(StatusCode::CREATED))
        };

        let handled = server().run_handler(&handler, request(), RequestLog::new()).await;
        assert_eq!(handled.dispatched.status, StatusCode::CREATED);
        assert_eq!(&handled.dispatched.body[..], b"hello");
        assert!(handled.error.is_none());
        assert_eq!(handled.fields.get("user"), Some(&serde_json::Value::from("alice")));
    }

    #[tokio::test]
    async fn test_handler_error_is_500() {
        let handler = |_req: Request, _log: RequestLog| async move {
            Err::<Response, _>(eyre::eyre!("database unavailable"))
        };

        let handled = server().run_handler(&handler, request(), RequestLog::new()).await;
        assert_eq!(handled.dispatched.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(handled.dispatched.body.is_empty());
        assert_eq!(handled.error.unwrap().message(), "database unavailable");
    }

    #[tokio::test]
    async fn test_response_error_keeps_status() {
        let handler = |_req: Request, _log: RequestLog| async move {
            Ok::<_, eyre::Report>(Response::text("stale").with_error(eyre::eyre!("cache refresh failed")))
        };

        let handled = server().run_handler(&handler, request(), RequestLog::new()).await;
        assert_eq!(handled.dispatched.status, StatusCode::OK);
        assert_eq!(handled.error.unwrap().message(), "cache refresh failed");
    }

    #[tokio::test]
    async fn test_recorded_error_then_panic_are_merged() {
        let handler = |_req: Request, log: RequestLog| async move {
            log.add_field("step", 1);
            log.record_error(eyre::eyre!("lookup failed"));
            tokio::task::yield_now().await;
            if true {
                panic!("index out of range");
            }
            Ok::<_, eyre::Report>(Response::empty())
        };

        let handled = server().run_handler(&handler, request(), RequestLog::new()).await;
        assert_eq!(handled.dispatched.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(handled.fields.get("step"), Some(&serde_json::Value::from(1)));

        let error = handled.error.unwrap();
        assert_eq!(error.message(), "lookup failed - panic: index out of range");
        assert!(!error.call_stack().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_before_first_await() {
        struct Eager;

        impl LoggedHandler for Eager {
            fn call(&self, _request: Request, _log: RequestLog) -> HandlerFuture {
                panic!("constructing future failed")
            }
        }

        let handled = server().run_handler(&Eager, request(), RequestLog::new()).await;
        assert_eq!(handled.dispatched.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            handled.error.unwrap().message(),
            "panic: constructing future failed"
        );
    }

    #[tokio::test]
    async fn test_serializer_panic_is_recovered() {
        struct Exploding;

        impl Serialize for Exploding {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                panic!("serializer exploded")
            }
        }

        let handler =
            |_req: Request, _log: RequestLog| async move { Ok::<_, eyre::Report>(Response::json(Exploding)) };

        let handled = server().run_handler(&handler, request(), RequestLog::new()).await;
        assert_eq!(handled.dispatched.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(handled.dispatched.encoding, Encoding::Identity);
        assert_eq!(handled.error.unwrap().message(), "panic: serializer exploded");
    }

    #[tokio::test]
    async fn test_explicit_call_stack() {
        let handler = |_req: Request, log: RequestLog| async move {
            log.add_call_stack();
            Ok::<_, eyre::Report>(Response::empty())
        };

        let handled = server().run_handler(&handler, request(), RequestLog::new()).await;
        assert!(handled.call_stack.is_some());
        assert!(handled.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_nothing_in_flight() {
        let server = server();
        assert_eq!(server.shutdown().await, ShutdownOutcome::Drained);
        assert!(server.is_stopped());
        assert!(!server.begin_shutdown());
    }
}
