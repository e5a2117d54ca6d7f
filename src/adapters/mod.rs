pub mod hostname_cache;
pub mod logged_service;
pub mod tracing_sink;

/// Re-export commonly used types from adapters
pub use hostname_cache::HostnameCache;
pub use logged_service::{LoggedBody, LoggedService};
pub use tracing_sink::TracingSink;
