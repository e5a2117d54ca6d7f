use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    signal,
    sync::broadcast,
    time::{Instant, interval_at, sleep},
};

use crate::{
    ports::log_sink::{LogRecord, LogSink, Severity},
    utils::connection_gate::ConnectionGate,
};

/// Drain deadline used when none (or zero) is configured.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between open-connection checks while draining.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What triggered a shutdown request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered programmatically
    Requested,
}

/// Listens for OS signals and broadcasts a single shutdown request.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Request shutdown without a signal. Only the first request is broadcast.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        self.initiate_shutdown(reason);
    }

    /// Wait for SIGINT or SIGTERM, then broadcast the shutdown request.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                self.initiate_shutdown(ShutdownReason::Interrupt);
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                self.initiate_shutdown(ShutdownReason::Terminate);
            }
        }
    }

    fn initiate_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Processing shutdown request: {:?}", reason);
            if self.shutdown_tx.send(reason).is_err() {
                tracing::debug!("No shutdown subscribers");
            }
        } else {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
        }
    }

    /// Wait until a shutdown request is broadcast.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        if self.is_shutdown_initiated() {
            return ShutdownReason::Requested;
        }
        match receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => {
                tracing::warn!("Shutdown channel closed unexpectedly");
                ShutdownReason::Requested
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

/// How a drain ended. Both outcomes are normal completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight request finished before the deadline.
    Drained,
    /// The deadline passed with requests still in flight.
    DeadlineExceeded { remaining: usize },
}

/// Closes the gate, then waits (bounded) for in-flight requests to finish.
///
/// Progress and the terminal state are reported through the [`LogSink`].
/// In-flight requests are never cancelled; the sequencer only stops waiting.
pub struct ShutdownSequencer {
    gate: Arc<ConnectionGate>,
    sink: Arc<dyn LogSink>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ShutdownSequencer {
    /// A zero `timeout` means [`DEFAULT_SHUTDOWN_TIMEOUT`].
    pub fn new(gate: Arc<ConnectionGate>, sink: Arc<dyn LogSink>, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_SHUTDOWN_TIMEOUT
        } else {
            timeout
        };
        Self {
            gate,
            sink,
            timeout,
            poll_interval: DRAIN_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self) -> ShutdownOutcome {
        self.gate.begin_shutdown();

        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);

        loop {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    let remaining = self.gate.open_count();
                    self.sink.emit(
                        LogRecord::new(
                            Severity::Error,
                            format!(
                                "stop deadline {} exceeded; abandoning {} open connections",
                                humantime::format_duration(self.timeout),
                                remaining
                            ),
                        )
                        .with_field("open_connections", remaining),
                    );
                    return ShutdownOutcome::DeadlineExceeded { remaining };
                }
                _ = ticker.tick() => {
                    let open = self.gate.open_count();
                    if open == 0 {
                        self.sink.emit(LogRecord::new(Severity::Info, "all connections closed"));
                        return ShutdownOutcome::Drained;
                    }
                    self.sink.emit(
                        LogRecord::new(
                            Severity::Info,
                            format!("waiting for {open} connections to close"),
                        )
                        .with_field("open_connections", open),
                    );
                }
            }
        }
    }
}
