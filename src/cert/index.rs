//! Multi-key certificate index.
//!
//! A [`CertIndexSnapshot`] maps four certificate facets to the
//! [`CertLocator`] of the directory entry holding the certificate. A rebuild
//! fills a fresh mutable snapshot, and [`CertificateIndex::publish`] freezes
//! it and swaps it in with one atomic pointer store. Readers load the pointer
//! and never block, and never see a half-built snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{debug, info};

use super::facets::DecodedCertificate;
use crate::dn;

/// Directory entry DN plus the thumbprint of one certificate stored there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CertLocator {
    /// Entry DN as returned by the directory
    pub dn: String,
    /// Base64 SHA-1 thumbprint
    pub thumbprint: String,
}

impl CertLocator {
    /// Locator for `thumbprint` at `dn`.
    #[must_use]
    pub fn new(dn: impl Into<String>, thumbprint: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            thumbprint: thumbprint.into(),
        }
    }
}

/// A certificate lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CertKey {
    /// Canonical issuer DN and decimal serial
    IssuerSerial {
        /// Canonical issuer DN
        issuer: String,
        /// Decimal serial
        serial: String,
    },
    /// Base64 subject key identifier
    Ski(String),
    /// Base64 SHA-1 thumbprint
    Thumbprint(String),
    /// Canonical subject DN
    SubjectDn(String),
}

impl CertKey {
    /// Issuer and serial key; the issuer is canonicalised.
    #[must_use]
    pub fn issuer_serial(issuer: &str, serial: &str) -> Self {
        Self::IssuerSerial {
            issuer: dn::canonicalize(issuer),
            serial: serial.trim().to_string(),
        }
    }

    /// Subject DN key; the DN is canonicalised.
    #[must_use]
    pub fn subject_dn(subject: &str) -> Self {
        Self::SubjectDn(dn::canonicalize(subject))
    }

    /// Short name of the facet, for logs.
    #[must_use]
    pub fn facet(&self) -> &'static str {
        match self {
            Self::IssuerSerial { .. } => "issuer_serial",
            Self::Ski(_) => "ski",
            Self::Thumbprint(_) => "thumbprint",
            Self::SubjectDn(_) => "subject",
        }
    }

    /// Whether `cert` carries this facet value.
    #[must_use]
    pub fn matches(&self, cert: &DecodedCertificate) -> bool {
        let f = cert.facets();
        match self {
            Self::IssuerSerial { issuer, serial } => f.issuer_dn == *issuer && f.serial == *serial,
            Self::Ski(ski) => f.ski.as_deref() == Some(ski.as_str()),
            Self::Thumbprint(t) => f.thumbprint_sha1 == *t,
            Self::SubjectDn(s) => f.subject_dn == *s,
        }
    }
}

/// Entry counts per facet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexSizes {
    /// Issuer/serial keys
    pub issuer_serial: usize,
    /// SKI keys
    pub ski: usize,
    /// Thumbprint keys
    pub thumbprint: usize,
    /// Subject DN keys
    pub subject: usize,
}

/// One generation of the index.
#[derive(Debug, Clone, Default)]
pub struct CertIndexSnapshot {
    by_issuer_serial: HashMap<(String, String), CertLocator>,
    by_ski: HashMap<String, CertLocator>,
    by_thumbprint: HashMap<String, CertLocator>,
    by_subject: HashMap<String, CertLocator>,
    frozen: bool,
}

impl CertIndexSnapshot {
    /// Empty, mutable snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `cert` as found at `dn` under all of its facets.
    ///
    /// Returns `None` without touching the maps once the snapshot is frozen.
    pub fn index_certificate(&mut self, dn: &str, cert: &DecodedCertificate) -> Option<CertLocator> {
        if self.frozen {
            debug!(dn, "Ignoring insert into frozen certificate index");
            return None;
        }
        let facets = cert.facets();
        if facets.thumbprint_sha1.is_empty() {
            return None;
        }
        let locator = CertLocator::new(dn, facets.thumbprint_sha1.clone());
        self.by_issuer_serial.insert(
            (facets.issuer_dn.clone(), facets.serial.clone()),
            locator.clone(),
        );
        if let Some(ski) = &facets.ski {
            self.by_ski.insert(ski.clone(), locator.clone());
        }
        self.by_thumbprint
            .insert(facets.thumbprint_sha1.clone(), locator.clone());
        self.by_subject
            .insert(facets.subject_dn.clone(), locator.clone());
        Some(locator)
    }

    /// Seal the snapshot; later inserts are no-ops.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the snapshot is sealed.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Locator for `key`, if indexed.
    #[must_use]
    pub fn lookup(&self, key: &CertKey) -> Option<&CertLocator> {
        match key {
            CertKey::IssuerSerial { issuer, serial } => {
                self.by_issuer_serial.get(&(issuer.clone(), serial.clone()))
            }
            CertKey::Ski(ski) => self.by_ski.get(ski),
            CertKey::Thumbprint(t) => self.by_thumbprint.get(t),
            CertKey::SubjectDn(s) => self.by_subject.get(s),
        }
    }

    /// Entry counts.
    #[must_use]
    pub fn sizes(&self) -> IndexSizes {
        IndexSizes {
            issuer_serial: self.by_issuer_serial.len(),
            ski: self.by_ski.len(),
            thumbprint: self.by_thumbprint.len(),
            subject: self.by_subject.len(),
        }
    }

    /// Number of indexed certificates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_thumbprint.len()
    }

    /// Whether nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_thumbprint.is_empty()
    }

    /// Locators addressed by the issuer/serial and SKI keys.
    fn addressed(&self, issuer_serial: Option<&(String, String)>, ski: Option<&str>) -> Vec<CertLocator> {
        let mut found: Vec<CertLocator> = Vec::new();
        let hits = [
            issuer_serial.and_then(|k| self.by_issuer_serial.get(k)),
            ski.and_then(|s| self.by_ski.get(s)),
        ];
        for locator in hits.into_iter().flatten() {
            if !found.contains(locator) {
                found.push(locator.clone());
            }
        }
        found
    }

    /// Drop every key that points at one of `locators`.
    fn remove_locators(&mut self, locators: &[CertLocator]) {
        self.by_issuer_serial.retain(|_, l| !locators.contains(l));
        self.by_ski.retain(|_, l| !locators.contains(l));
        self.by_thumbprint.retain(|_, l| !locators.contains(l));
        self.by_subject.retain(|_, l| !locators.contains(l));
    }
}

/// The published index for one provider.
#[derive(Debug)]
pub struct CertificateIndex {
    current: ArcSwap<CertIndexSnapshot>,
}

impl Default for CertificateIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateIndex {
    /// Index with an empty published snapshot.
    #[must_use]
    pub fn new() -> Self {
        let mut empty = CertIndexSnapshot::new();
        empty.freeze();
        Self {
            current: ArcSwap::from_pointee(empty),
        }
    }

    /// Locator for `key` in the current snapshot.
    pub fn lookup_locator(&self, key: &CertKey) -> Option<CertLocator> {
        self.current.load().lookup(key).cloned()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<CertIndexSnapshot> {
        self.current.load_full()
    }

    /// Freeze `snapshot` and make it current.
    pub fn publish(&self, mut snapshot: CertIndexSnapshot) {
        snapshot.freeze();
        let sizes = snapshot.sizes();
        self.current.store(Arc::new(snapshot));
        info!(
            certificates = sizes.thumbprint,
            ski_keys = sizes.ski,
            subjects = sizes.subject,
            "Published certificate index"
        );
    }

    /// Remove a certificate that no longer exists upstream.
    ///
    /// The issuer/serial and SKI keys select the locator(s); every key in
    /// all four maps that points at a selected locator is removed, so no
    /// facet of the stale certificate keeps resolving. Returns whether
    /// anything was removed.
    pub fn remove_index_entry(&self, issuer: Option<&str>, serial: Option<&str>, ski: Option<&str>) -> bool {
        let issuer_serial = match (issuer, serial) {
            (Some(i), Some(s)) => Some((dn::canonicalize(i), s.trim().to_string())),
            _ => None,
        };
        if self
            .current
            .load()
            .addressed(issuer_serial.as_ref(), ski)
            .is_empty()
        {
            return false;
        }

        let mut removed = Vec::new();
        self.current.rcu(|current| {
            let mut next = CertIndexSnapshot::clone(current);
            removed = next.addressed(issuer_serial.as_ref(), ski);
            next.remove_locators(&removed);
            next
        });
        for locator in &removed {
            info!(dn = %locator.dn, thumbprint = %locator.thumbprint, "Removed stale certificate from index");
        }
        !removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyIdMethod, KeyPair, SerialNumber};

    fn cert(cn: &str, serial: u8, ski: &[u8]) -> DecodedCertificate {
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, cn);
        params.distinguished_name = name;
        params.serial_number = Some(SerialNumber::from_slice(&[serial]));
        params.key_identifier_method = KeyIdMethod::PreSpecified(ski.to_vec());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().unwrap();
        let der = params.self_signed(&key).unwrap().der().to_vec();
        DecodedCertificate::from_der(&der).unwrap()
    }

    fn all_keys(cert: &DecodedCertificate) -> Vec<CertKey> {
        let f = cert.facets();
        vec![
            CertKey::issuer_serial(&f.issuer_dn, &f.serial),
            CertKey::Ski(f.ski.clone().unwrap()),
            CertKey::Thumbprint(f.thumbprint_sha1.clone()),
            CertKey::subject_dn(&f.subject_dn),
        ]
    }

    #[test]
    fn every_facet_resolves_to_the_same_locator() {
        let c = cert("alice", 3, &[1, 2]);
        let mut snap = CertIndexSnapshot::new();
        let locator = snap.index_certificate("cn=alice,dc=x", &c).unwrap();
        for key in all_keys(&c) {
            assert_eq!(snap.lookup(&key), Some(&locator), "facet {}", key.facet());
        }
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn frozen_snapshot_ignores_inserts() {
        let c = cert("alice", 3, &[1, 2]);
        let mut snap = CertIndexSnapshot::new();
        snap.freeze();
        assert!(snap.index_certificate("cn=alice,dc=x", &c).is_none());
        assert!(snap.is_empty());
    }

    #[test]
    fn lookups_canonicalise_dns() {
        let c = cert("Alice", 3, &[1, 2]);
        let index = CertificateIndex::new();
        let mut snap = CertIndexSnapshot::new();
        snap.index_certificate("cn=alice,dc=x", &c);
        index.publish(snap);

        assert!(index.lookup_locator(&CertKey::issuer_serial("CN = ALICE", "3")).is_some());
        assert!(index.lookup_locator(&CertKey::subject_dn("cn=alice")).is_some());
        assert!(index.lookup_locator(&CertKey::issuer_serial("cn=alice", "4")).is_none());
    }

    #[test]
    fn removal_clears_all_four_facets() {
        let a = cert("a", 1, &[1]);
        let b = cert("b", 2, &[2]);
        let index = CertificateIndex::new();
        let mut snap = CertIndexSnapshot::new();
        snap.index_certificate("cn=a,dc=x", &a);
        snap.index_certificate("cn=b,dc=x", &b);
        index.publish(snap);

        let fa = a.facets();
        assert!(index.remove_index_entry(Some(&fa.issuer_dn), Some(&fa.serial), None));
        for key in all_keys(&a) {
            assert!(index.lookup_locator(&key).is_none(), "facet {} survived", key.facet());
        }
        for key in all_keys(&b) {
            assert!(index.lookup_locator(&key).is_some());
        }
        assert!(index.snapshot().is_frozen());

        let fb = b.facets();
        assert!(index.remove_index_entry(None, None, fb.ski.as_deref()));
        assert!(index.snapshot().is_empty());
        assert!(!index.remove_index_entry(None, None, Some("missing")));
    }

    #[test]
    fn publish_swaps_whole_snapshot() {
        let index = CertificateIndex::new();
        let old = index.snapshot();
        let mut snap = CertIndexSnapshot::new();
        snap.index_certificate("cn=a,dc=x", &cert("a", 1, &[1]));
        index.publish(snap);
        assert!(old.is_empty());
        assert_eq!(index.snapshot().len(), 1);
    }
}
