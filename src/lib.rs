//! httplog - structured request logging for HTTP handlers.
//!
//! httplog wraps application handlers into `tower` services (usable directly
//! with axum or hyper) and gives every request:
//!
//! - exactly one structured, leveled log record (severity from the status code)
//! - panic isolation: a panicking handler answers 500 and logs the panic site
//! - transparent gzip: on-the-fly compression for clients that accept it,
//!   passthrough or decompression of bodies that are already gzip
//! - admission control and bounded draining for graceful shutdown
//!
//! # Quick Example
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use httplog::{Request, RequestLog, Response, Server, config::ServerConfig};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let server = Server::new(&ServerConfig::default());
//! let hello = server.handle("hello", |_req: Request, log: RequestLog| async move {
//!     log.add_field("greeting", "hi");
//!     Ok::<_, eyre::Report>(Response::text("hello"))
//! });
//!
//! let app = axum::Router::new().route_service("/hello", hello);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
//!     .with_graceful_shutdown({
//!         let server = server.clone();
//!         async move {
//!             let _ = tokio::signal::ctrl_c().await;
//!             server.shutdown().await;
//!         }
//!     })
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits for the log sink and the reverse
//! resolver) from **adapters** (the tower service, the `tracing` sink, the
//! hostname cache) while keeping request semantics inside `core`.
//!
//! # Error Handling
//! Handlers return `eyre::Result<Response>`. Configuration APIs return
//! `eyre::Result<T>` with `WrapErr` context; request failures are folded into
//! a [`ReportableError`](core::ReportableError) on the log record.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HostnameCache, LoggedBody, LoggedService, TracingSink},
    core::{LoggedHandler, Request, RequestLog, Response, Server},
    ports::{LogRecord, LogSink, Severity},
    utils::{GracefulShutdown, ShutdownOutcome},
};
