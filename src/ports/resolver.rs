use std::net::IpAddr;

use thiserror::Error;

/// Error type for reverse address lookups
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ResolveError {
    /// No name is registered for the address
    #[error("no hostname found for {0}")]
    NotFound(IpAddr),

    /// The lookup itself failed
    #[error("reverse lookup failed: {0}")]
    Lookup(String),
}

/// ReverseResolver defines the port for mapping a client address to a hostname.
///
/// Lookups may block for a long time; callers must not hold shared locks
/// while invoking `resolve`.
pub trait ReverseResolver: Send + Sync + 'static {
    /// Resolve `ip` to a hostname
    ///
    /// # Arguments
    /// * `ip` - The client address to look up
    ///
    /// # Returns
    /// The hostname registered for the address, or an error
    fn resolve(&self, ip: IpAddr) -> Result<String, ResolveError>;
}

impl<F> ReverseResolver for F
where
    F: Fn(IpAddr) -> Result<String, ResolveError> + Send + Sync + 'static,
{
    fn resolve(&self, ip: IpAddr) -> Result<String, ResolveError> {
        self(ip)
    }
}
