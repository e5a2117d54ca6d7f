//! Connection Gate: admission control and in-flight accounting.
//!
//! Two atomics sit on the hot path of every request: a monotonic `stopped`
//! flag and the count of admitted requests that have not finished yet. The
//! Shutdown Sequencer only reads them.
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::metrics;

#[derive(Debug, Default)]
pub struct ConnectionGate {
    stopped: AtomicBool,
    open: AtomicUsize,
}

impl ConnectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one request unless shutdown has begun.
    ///
    /// Every `true` must be paired with exactly one [`release`](Self::release).
    /// The count is raised before `stopped` is checked, so a drain that has
    /// observed zero cannot miss a request admitted concurrently.
    pub fn admit(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stopped.load(Ordering::SeqCst) {
            self.release();
            return false;
        }
        metrics::set_open_connections(open);
        true
    }

    /// Release a slot taken by [`admit`](Self::admit). Never goes below zero.
    pub fn release(&self) {
        match self
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => metrics::set_open_connections(previous - 1),
            Err(_) => tracing::warn!("Connection gate released with no open connections"),
        }
    }

    /// Stop admitting requests. Returns `true` only for the first call.
    pub fn begin_shutdown(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(
                open_connections = self.open_count(),
                "Connection gate closed"
            );
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Snapshot of admitted requests still in flight.
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Admit and wrap the slot in a guard that releases it on drop.
    pub fn try_enter(self: &Arc<Self>) -> Option<InFlight> {
        self.admit().then(|| InFlight {
            gate: Arc::clone(self),
        })
    }
}

/// An admitted request; its slot is released exactly once, on drop.
#[derive(Debug)]
pub struct InFlight {
    gate: Arc<ConnectionGate>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.gate.release();
    }
}
