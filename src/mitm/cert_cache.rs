//! Certificate Cache
//!
//! Host-keyed LRU cache for issued leaf certificates. Entries remember the
//! root generation they were signed under and when they were issued; a lookup
//! that finds a stale or expired entry drops it and reports a miss.

use super::certificate_authority::IssuedCertificate;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CachedCertificate {
    cert: Arc<IssuedCertificate>,
    created_at: Instant,
    root_generation: u64,
}

impl CachedCertificate {
    fn is_usable(&self, ttl: Duration, root_generation: u64) -> bool {
        self.root_generation == root_generation && self.created_at.elapsed() <= ttl
    }
}

/// Certificate cache with LRU eviction policy
pub struct CertCache {
    cache: LruCache<String, CachedCertificate>,
    ttl: Duration,
    hits: u64,
    misses: u64,
}

impl CertCache {
    /// Create a cache holding at most `capacity` hosts (minimum 1)
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            ttl,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a certificate issued under `root_generation`
    pub fn get(&mut self, host: &str, root_generation: u64) -> Option<Arc<IssuedCertificate>> {
        let usable = self
            .cache
            .get(host)
            .map(|entry| entry.is_usable(self.ttl, root_generation));

        match usable {
            Some(true) => {
                self.hits += 1;
                self.cache.get(host).map(|entry| Arc::clone(&entry.cert))
            }
            Some(false) => {
                self.cache.pop(host);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a certificate, returning the host evicted to make room
    pub fn insert(
        &mut self,
        host: String,
        cert: Arc<IssuedCertificate>,
        root_generation: u64,
    ) -> Option<String> {
        let entry = CachedCertificate {
            cert,
            created_at: Instant::now(),
            root_generation,
        };
        match self.cache.push(host.clone(), entry) {
            Some((evicted, _)) if evicted != host => Some(evicted),
            _ => None,
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.cache.contains(host)
    }

    /// Get the number of certificates in the cache
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Get the cache hit rate (hits / total requests)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Clear the cache
    pub fn clear(&mut self) {
        self.cache.clear();
        self.hits = 0;
        self.misses = 0;
    }
}
