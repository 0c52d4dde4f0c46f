//! Shared cache statistics.
//!
//! The certificate cache and the group cache both count hits, misses and
//! evictions with relaxed atomics and report them as a
//! [`CacheStatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: AtomicU64,
    /// Lookups not found or expired
    pub misses: AtomicU64,
    /// Entries removed for age or capacity
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Create new statistics with all counters at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a hit.
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a miss.
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `n` evictions.
    pub fn evicted(&self, n: usize) {
        if n > 0 {
            self.evictions.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Get current cache hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get current cache miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Calculate hit rate as a fraction (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Snapshot with the current entry count.
    #[must_use]
    pub fn snapshot(&self, size: usize) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            size,
            hit_rate: self.hit_rate(),
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_with_no_traffic_is_zero() {
        let stats = CacheStats::new();
        assert!(stats.hit_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = CacheStats::new();
        stats.hit();
        stats.hit();
        stats.hit();
        stats.miss();
        stats.evicted(0);
        stats.evicted(2);
        let snap = stats.snapshot(7);
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.evictions, 2);
        assert_eq!(snap.size, 7);
        assert!((snap.hit_rate - 0.75).abs() < f64::EPSILON);
    }
}
