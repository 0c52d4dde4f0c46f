//! Certificate lookups for one provider.
//!
//! In `index` mode a lookup is a pure read of the published index followed
//! by a cache resolve. In `search` mode every lookup runs the configured
//! filter template against the directory and caches what it finds. In
//! `disabled` mode nothing is found.

use std::sync::Arc;

use tracing::{debug, warn};

use super::cache::{CertificateCache, ResolvedCertificate};
use super::facets::DecodedCertificate;
use super::index::{CertKey, CertLocator, CertificateIndex};
use crate::config::{CertificateMode, ProviderConfig};
use crate::config_reload::LiveConfig;
use crate::directory::filter::{Filter, expand_template};
use crate::directory::{Directory, SearchRequest};
use crate::Result;

const DEFAULT_CERT_ATTRIBUTE: &str = "userCertificate";

/// Certificate attributes to read, falling back to `userCertificate`.
#[must_use]
pub fn cert_attributes(config: &ProviderConfig) -> Vec<String> {
    let attrs = config.cert_attributes();
    if attrs.is_empty() {
        vec![DEFAULT_CERT_ATTRIBUTE.to_string()]
    } else {
        attrs
    }
}

/// Certificate lookup façade.
pub struct CertificateStore {
    config: Arc<LiveConfig>,
    directory: Arc<dyn Directory>,
    index: Arc<CertificateIndex>,
    cache: Arc<CertificateCache>,
}

impl CertificateStore {
    /// Store over shared index and cache.
    #[must_use]
    pub fn new(
        config: Arc<LiveConfig>,
        directory: Arc<dyn Directory>,
        index: Arc<CertificateIndex>,
        cache: Arc<CertificateCache>,
    ) -> Self {
        Self {
            config,
            directory,
            index,
            cache,
        }
    }

    /// Certificate with the given issuer DN and decimal serial.
    pub fn find_by_issuer_and_serial(&self, issuer: &str, serial: &str) -> Result<Option<ResolvedCertificate>> {
        self.find(&CertKey::issuer_serial(issuer, serial))
    }

    /// Certificate with the given base64 subject key identifier.
    pub fn find_by_ski(&self, ski: &str) -> Result<Option<ResolvedCertificate>> {
        self.find(&CertKey::Ski(ski.to_string()))
    }

    /// Certificate with the given base64 SHA-1 thumbprint.
    ///
    /// In search mode a failed directory query is returned as an error
    /// rather than `None`.
    pub fn find_by_thumbprint_sha1(&self, thumbprint: &str) -> Result<Option<ResolvedCertificate>> {
        self.find(&CertKey::Thumbprint(thumbprint.to_string()))
    }

    /// Certificate with the given subject DN.
    pub fn find_by_subject_dn(&self, subject: &str) -> Result<Option<ResolvedCertificate>> {
        self.find(&CertKey::subject_dn(subject))
    }

    /// Look up by any facet.
    pub fn find(&self, key: &CertKey) -> Result<Option<ResolvedCertificate>> {
        let config = self.config.get();
        match config.certificates.mode {
            CertificateMode::Disabled => Ok(None),
            CertificateMode::Index => Ok(self.find_indexed(key, &config)),
            CertificateMode::Search => self.find_by_search(key, &config),
        }
    }

    fn find_indexed(&self, key: &CertKey, config: &ProviderConfig) -> Option<ResolvedCertificate> {
        let Some(locator) = self.index.lookup_locator(key) else {
            debug!(facet = key.facet(), "Certificate not in index");
            return None;
        };
        self.cache
            .resolve(&locator, self.directory.as_ref(), &cert_attributes(config))
    }

    fn find_by_search(&self, key: &CertKey, config: &ProviderConfig) -> Result<Option<ResolvedCertificate>> {
        let filters = &config.certificates.search_filters;
        let template = match key {
            CertKey::IssuerSerial { .. } => filters.issuer_serial.as_ref(),
            CertKey::Ski(_) => filters.ski.as_ref(),
            CertKey::Thumbprint(_) => filters.thumbprint.as_ref(),
            CertKey::SubjectDn(_) => filters.subject.as_ref(),
        };
        let Some(template) = template else {
            debug!(facet = key.facet(), "No search filter configured for facet");
            return Ok(None);
        };

        let values: Vec<(&str, &str)> = match key {
            CertKey::IssuerSerial { issuer, serial } => {
                vec![("issuer", issuer.as_str()), ("serial", serial.as_str())]
            }
            CertKey::Ski(ski) => vec![("ski", ski.as_str())],
            CertKey::Thumbprint(t) => vec![("thumbprint", t.as_str())],
            CertKey::SubjectDn(s) => vec![("subject", s.as_str())],
        };
        let filter = Filter::parse(&expand_template(template, &values)?)?;
        let request = SearchRequest::new(config.search_base.clone(), filter)
            .limit(config.tunables.max_search_results);

        let results = match self.directory.search(&request) {
            Ok(r) => r,
            Err(e) if matches!(key, CertKey::Thumbprint(_)) => return Err(e.into()),
            Err(e) => {
                warn!(facet = key.facet(), error = %e, "Certificate search failed");
                return Ok(None);
            }
        };

        let attrs = cert_attributes(config);
        for entry in results.entries {
            for attr in &attrs {
                for value in entry.attributes.binaries(attr) {
                    let Ok(cert) = DecodedCertificate::decode(value) else {
                        continue;
                    };
                    if key.matches(&cert) {
                        let locator = CertLocator::new(entry.dn.clone(), cert.thumbprint());
                        let resolved = ResolvedCertificate {
                            subject_dn: entry.dn.clone(),
                            certificate: Arc::new(cert),
                        };
                        self.cache.insert(locator, resolved.clone());
                        return Ok(Some(resolved));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Shared index.
    pub fn index(&self) -> &Arc<CertificateIndex> {
        &self.index
    }

    /// Shared cache.
    pub fn cache(&self) -> &Arc<CertificateCache> {
        &self.cache
    }
}
