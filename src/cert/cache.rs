//! Decoded-certificate cache keyed by [`CertLocator`].
//!
//! One read-write lock guards the map. Directory fetches and certificate
//! decoding happen with no lock held; only the final insert takes the write
//! lock. Entries live until a sweep finds them older than the configured
//! lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::facets::DecodedCertificate;
use super::index::CertLocator;
use crate::cache::{CacheStats, CacheStatsSnapshot};
use crate::clock::{Clock, duration_ms};
use crate::directory::DirectoryEntryFetch;

/// A certificate together with the entry it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCertificate {
    /// DN of the directory entry holding the certificate
    pub subject_dn: String,
    /// The certificate
    pub certificate: Arc<DecodedCertificate>,
}

#[derive(Debug, Clone)]
struct CertCacheEntry {
    resolved: ResolvedCertificate,
    created_ms: u64,
}

/// Cache of certificates fetched from the directory.
#[derive(Debug)]
pub struct CertificateCache {
    entries: RwLock<HashMap<CertLocator, CertCacheEntry>>,
    stats: CacheStats,
    clock: Arc<dyn Clock>,
}

impl CertificateCache {
    /// Empty cache stamping entries with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::new(),
            clock,
        }
    }

    /// Cached certificate for `locator`.
    pub fn get(&self, locator: &CertLocator) -> Option<ResolvedCertificate> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(locator) {
            self.stats.hit();
            Some(entry.resolved.clone())
        } else {
            self.stats.miss();
            None
        }
    }

    /// Store a certificate, replacing any entry for the same locator.
    pub fn insert(&self, locator: CertLocator, resolved: ResolvedCertificate) {
        let entry = CertCacheEntry {
            resolved,
            created_ms: self.clock.now_ms(),
        };
        self.entries.write().insert(locator, entry);
    }

    /// Certificate for `locator`, from the cache or else fetched from the
    /// directory entry's `cert_attributes`.
    ///
    /// Directory failures and entries that no longer carry the certificate
    /// yield `None`; the index is left alone either way.
    pub fn resolve(
        &self,
        locator: &CertLocator,
        directory: &dyn DirectoryEntryFetch,
        cert_attributes: &[String],
    ) -> Option<ResolvedCertificate> {
        if let Some(hit) = self.get(locator) {
            return Some(hit);
        }

        let attributes = match directory.get_attributes(&locator.dn) {
            Ok(Some(attrs)) => attrs,
            Ok(None) => {
                info!(dn = %locator.dn, "Certificate is indexed but its entry is gone from the directory");
                return None;
            }
            Err(e) => {
                warn!(dn = %locator.dn, error = %e, "Could not fetch certificate entry");
                return None;
            }
        };

        for attr in cert_attributes {
            for value in attributes.binaries(attr) {
                match DecodedCertificate::decode(value) {
                    Ok(cert) if cert.thumbprint() == locator.thumbprint => {
                        let resolved = ResolvedCertificate {
                            subject_dn: locator.dn.clone(),
                            certificate: Arc::new(cert),
                        };
                        self.insert(locator.clone(), resolved.clone());
                        return Some(resolved);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(dn = %locator.dn, attr = %attr, error = %e, "Skipping undecodable certificate value"),
                }
            }
        }

        info!(
            dn = %locator.dn,
            thumbprint = %locator.thumbprint,
            "Indexed certificate no longer present on entry"
        );
        None
    }

    /// Remove entries older than `lifetime`; returns how many were removed.
    ///
    /// Candidates are collected under the read lock and removed under the
    /// write lock.
    pub fn sweep(&self, lifetime: Duration) -> usize {
        let now = self.clock.now_ms();
        let max_age = duration_ms(lifetime);
        let expired: Vec<CertLocator> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.created_ms) > max_age)
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write();
        let mut removed = 0;
        for key in &expired {
            // Re-check: the entry may have been refreshed between the two phases.
            if entries
                .get(key)
                .is_some_and(|e| now.saturating_sub(e.created_ms) > max_age)
            {
                entries.remove(key);
                removed += 1;
            }
        }
        drop(entries);
        self.stats.evicted(removed);
        debug!(removed, "Swept certificate cache");
        removed
    }

    /// Number of cached certificates.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::directory::Attributes;
    use crate::directory::memory::InMemoryDirectory;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn der(cn: &str) -> Vec<u8> {
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, cn);
        params.distinguished_name = name;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn attrs() -> Vec<String> {
        vec!["userCertificate".to_string()]
    }

    #[test]
    fn miss_fetches_and_fills() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = CertificateCache::new(clock);
        let dir = InMemoryDirectory::new();
        let other = der("other");
        let mine = der("bob");
        dir.add_entry(
            "cn=bob,dc=x",
            Attributes::new()
                .with_bytes("userCertificate;binary", other)
                .with_bytes("userCertificate;binary", mine.clone()),
        );
        let locator = CertLocator::new("cn=bob,dc=x", super::super::facets::thumbprint_sha1(&mine));

        let resolved = cache.resolve(&locator, &dir, &attrs()).unwrap();
        assert_eq!(resolved.subject_dn, "cn=bob,dc=x");
        assert_eq!(resolved.certificate.der(), mine.as_slice());
        assert_eq!(dir.fetch_count(), 1);

        cache.resolve(&locator, &dir, &attrs()).unwrap();
        assert_eq!(dir.fetch_count(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn unconfirmed_locator_is_not_cached() {
        let cache = CertificateCache::new(Arc::new(ManualClock::new(0)));
        let dir = InMemoryDirectory::new();
        dir.add_entry("cn=bob,dc=x", Attributes::new().with_bytes("userCertificate", der("bob")));

        let locator = CertLocator::new("cn=bob,dc=x", "not-the-thumbprint");
        assert!(cache.resolve(&locator, &dir, &attrs()).is_none());
        let gone = CertLocator::new("cn=gone,dc=x", "x");
        assert!(cache.resolve(&gone, &dir, &attrs()).is_none());
        dir.set_unavailable(true);
        assert!(cache.resolve(&locator, &dir, &attrs()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = CertificateCache::new(clock.clone());
        let cert = Arc::new(DecodedCertificate::from_der(&der("a")).unwrap());
        let resolved = ResolvedCertificate {
            subject_dn: "cn=a".to_string(),
            certificate: cert,
        };
        cache.insert(CertLocator::new("cn=a", "1"), resolved.clone());
        clock.advance(Duration::from_secs(30));
        cache.insert(CertLocator::new("cn=b", "2"), resolved);

        clock.advance(Duration::from_secs(31));
        assert_eq!(cache.sweep(Duration::from_secs(60)), 1);
        assert!(cache.get(&CertLocator::new("cn=a", "1")).is_none());
        assert!(cache.get(&CertLocator::new("cn=b", "2")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }
}
