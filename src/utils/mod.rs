pub mod connection_gate;
pub mod graceful_shutdown;

pub use connection_gate::{ConnectionGate, InFlight};
pub use graceful_shutdown::{GracefulShutdown, ShutdownOutcome, ShutdownReason, ShutdownSequencer};
