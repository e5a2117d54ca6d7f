use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{PoisonError, RwLock},
};

use crate::ports::resolver::ReverseResolver;

/// Shared client-address to hostname cache used for the `remote_host` field.
///
/// Hits take the read lock only. A miss resolves with no lock held and then
/// inserts under the write lock, so concurrent misses for one address may each
/// resolve; the last insert wins. Failed lookups cache the textual address.
pub struct HostnameCache {
    entries: RwLock<HashMap<IpAddr, String>>,
    resolver: Box<dyn ReverseResolver>,
}

impl HostnameCache {
    pub fn new(resolver: impl ReverseResolver) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            resolver: Box::new(resolver),
        }
    }

    /// Hostname for `ip`, resolving and caching it on first use.
    ///
    /// May block on the resolver; call from a blocking context.
    pub fn lookup(&self, ip: IpAddr) -> String {
        if let Some(host) = self.cached(ip) {
            return host;
        }

        let host = match self.resolver.resolve(ip) {
            Ok(host) => host,
            Err(err) => {
                tracing::debug!(%ip, error = %err, "Reverse lookup failed");
                ip.to_string()
            }
        };

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip, host.clone());
        host
    }

    pub fn cached(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HostnameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostnameCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}
