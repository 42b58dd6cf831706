// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Refreshing DNS cache with single-flight lookups.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long a resolved entry is served without a new lookup.
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(60);

/// How often cached entries are re-resolved in the background.
pub const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Resolves a hostname to addresses.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Addresses of `host`.
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver of the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

type Resolved = Result<Arc<Vec<IpAddr>>, Arc<io::Error>>;

#[derive(Debug, Clone)]
struct Entry {
    addrs: Arc<Vec<IpAddr>>,
    expires_at: Instant,
}

/// Caches lookups for [`DNS_CACHE_TTL`]. Concurrent misses for the same host
/// share one lookup.
pub struct DnsCache {
    lookup: Arc<dyn Lookup>,
    ttl: Duration,
    entries: DashMap<String, Entry>,
    inflight: Mutex<HashMap<String, Arc<OnceCell<Resolved>>>>,
}

impl std::fmt::Debug for DnsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl DnsCache {
    /// Cache in front of `lookup`.
    pub fn new(lookup: Arc<dyn Lookup>) -> Self {
        Self::with_ttl(lookup, DNS_CACHE_TTL)
    }

    /// Cache in front of `lookup` with a custom TTL.
    pub fn with_ttl(lookup: Arc<dyn Lookup>, ttl: Duration) -> Self {
        Self {
            lookup,
            ttl,
            entries: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Addresses of `host`, from the cache when fresh.
    pub async fn resolve(&self, host: &str) -> io::Result<Arc<Vec<IpAddr>>> {
        if let Some(entry) = self.entries.get(host)
            && entry.expires_at > Instant::now()
        {
            return Ok(entry.addrs.clone());
        }

        let cell = {
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|_| io::Error::other("dns cache lock poisoned"))?;
            inflight
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let resolved = cell
            .get_or_init(|| async {
                let res = match self.lookup.lookup(host).await {
                    Ok(addrs) if addrs.is_empty() => Err(Arc::new(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses for {}", host),
                    ))),
                    Ok(addrs) => Ok(Arc::new(addrs)),
                    Err(e) => Err(Arc::new(e)),
                };
                if let Ok(addrs) = &res {
                    self.store(host, addrs.clone());
                }
                res
            })
            .await
            .clone();

        if let Ok(mut inflight) = self.inflight.lock()
            && inflight.get(host).is_some_and(|c| Arc::ptr_eq(c, &cell))
        {
            inflight.remove(host);
        }

        resolved.map_err(|e| io::Error::new(e.kind(), e.to_string()))
    }

    fn store(&self, host: &str, addrs: Arc<Vec<IpAddr>>) {
        self.entries.insert(
            host.to_string(),
            Entry {
                addrs,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Re-resolve every cached host. Hosts that no longer resolve are dropped.
    pub async fn refresh(&self) {
        let hosts: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for host in hosts {
            match self.lookup.lookup(&host).await {
                Ok(addrs) if !addrs.is_empty() => self.store(&host, Arc::new(addrs)),
                Ok(_) | Err(_) => {
                    debug!(host = %host, "dropping dns entry after failed refresh");
                    self.entries.remove(&host);
                }
            }
        }
    }

    /// Number of cached hosts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refresh the cache every `interval` until `cancel` fires.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => cache.refresh().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLookup {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Lookup for CountingLookup {
        async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if host == "missing.test" {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such host"));
            }
            Ok(vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))])
        }
    }

    fn counting(delay: Duration) -> Arc<CountingLookup> {
        Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    #[tokio::test]
    async fn test_cached_within_ttl() {
        let lookup = counting(Duration::ZERO);
        let cache = DnsCache::new(lookup.clone());

        cache.resolve("example.test").await.unwrap();
        cache.resolve("example.test").await.unwrap();

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_lookup() {
        let lookup = counting(Duration::from_millis(50));
        let cache = Arc::new(DnsCache::new(lookup.clone()));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve("example.test").await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_looked_up_again() {
        let lookup = counting(Duration::ZERO);
        let cache = DnsCache::with_ttl(lookup.clone(), Duration::ZERO);

        cache.resolve("example.test").await.unwrap();
        cache.resolve("example.test").await.unwrap();

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let lookup = counting(Duration::ZERO);
        let cache = DnsCache::new(lookup.clone());

        assert!(cache.resolve("missing.test").await.is_err());
        assert!(cache.resolve("missing.test").await.is_err());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_relooks_cached_hosts() {
        let lookup = counting(Duration::ZERO);
        let cache = DnsCache::new(lookup.clone());
        cache.resolve("example.test").await.unwrap();

        cache.refresh().await;

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }
}
