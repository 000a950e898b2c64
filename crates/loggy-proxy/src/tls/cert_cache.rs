//! Per-host cache of minted server certificates.
//!
//! Leaf minting costs a key generation and a signature, so each SNI host
//! is minted once per session and reused. The cache is bounded; if an
//! unusually varied browsing session fills it, the stalest host is
//! dropped and simply re-minted on next sight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Default number of host certificates to keep.
pub const DEFAULT_CACHE_SIZE: usize = 1000;

struct CacheEntry {
    config: Arc<rustls::ServerConfig>,
    last_access: Instant,
}

/// Cache of `rustls::ServerConfig` instances keyed by SNI hostname.
pub struct CertificateCache {
    max_size: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CertificateCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }

    /// Cached server configuration for the host, refreshing its age.
    pub async fn get(&self, host: &str) -> Option<Arc<rustls::ServerConfig>> {
        let mut entries = self.entries.write().await;
        entries.get_mut(host).map(|entry| {
            entry.last_access = Instant::now();
            entry.config.clone()
        })
    }

    /// Insert a freshly minted configuration, evicting the stalest
    /// entry when full.
    pub async fn insert(&self, host: String, config: Arc<rustls::ServerConfig>) {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_size && !entries.contains_key(&host) {
            if let Some(stalest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&stalest);
                tracing::debug!(host = %stalest, "Evicted cached certificate");
            }
        }

        entries.insert(
            host,
            CacheEntry {
                config,
                last_access: Instant::now(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::with_default_size()
    }
}
