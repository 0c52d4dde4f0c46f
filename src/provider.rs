//! The directory identity provider.
//!
//! [`LdapIdentityProvider`] owns one provider's components: the live
//! configuration, the endpoint tracker, the directory connector, the
//! certificate index/cache, the group resolver and the maintenance tasks.
//! Nothing is shared between providers; two configurations give two fully
//! independent instances.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::CacheStatsSnapshot;
use crate::cert::store::cert_attributes;
use crate::cert::{CertificateCache, CertificateIndex, CertificateStore, DecodedCertificate, ResolvedCertificate};
use crate::cert::index::IndexSizes;
use crate::clock::{Clock, SystemClock};
use crate::config::ProviderConfig;
use crate::config_reload::LiveConfig;
use crate::directory::ldap::LdapDirectory;
use crate::directory::{Directory, DirectoryError, ProviderLiveness};
use crate::failover::{EndpointStatus, UrlFailoverTracker};
use crate::group::GroupResolver;
use crate::identity::{EntityKind, Group, HeaderSet, User, account_status};
use crate::maintenance::{IndexMaintenance, MaintenanceHandle};
use crate::{Error, Result};

/// Credentials presented for authentication.
#[derive(Clone)]
pub enum Credentials {
    /// Simple bind with login name and password
    Password {
        /// Login name
        login: String,
        /// Password
        password: String,
    },
    /// A client certificate, optionally with the login it claims
    ClientCert {
        /// Claimed login; when absent the certificate alone identifies the user
        login: Option<String>,
        /// Certificate in DER, PEM or base64 form
        certificate: Vec<u8>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { login, .. } => f
                .debug_struct("Password")
                .field("login", login)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::ClientCert { login, certificate } => f
                .debug_struct("ClientCert")
                .field("login", login)
                .field("certificate_len", &certificate.len())
                .finish(),
        }
    }
}

/// Counters for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    /// Provider name
    pub provider: String,
    /// Certificate index keys per facet
    pub index: IndexSizes,
    /// Certificate cache counters
    pub certificate_cache: CacheStatsSnapshot,
    /// Group cache counters
    pub group_cache: CacheStatsSnapshot,
    /// Endpoint health, when a tracker is in use
    pub endpoints: Vec<EndpointStatus>,
}

/// One configured directory identity provider.
pub struct LdapIdentityProvider {
    config: Arc<LiveConfig>,
    tracker: Option<Arc<UrlFailoverTracker>>,
    directory: Arc<dyn Directory>,
    certificates: CertificateStore,
    groups: GroupResolver,
    maintenance: Arc<IndexMaintenance>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LdapIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapIdentityProvider")
            .field("name", &self.config.get().name)
            .finish_non_exhaustive()
    }
}

impl LdapIdentityProvider {
    /// Provider talking LDAP to the configured endpoints.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the configuration is invalid or asks for a TLS
    /// mode the connector cannot provide.
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tracker = Arc::new(UrlFailoverTracker::new(
            config.name.clone(),
            config.urls.clone(),
            config.tunables.reconnect_timeout,
            Arc::clone(&clock),
        )?);
        let live = Arc::new(LiveConfig::new(config));
        let directory: Arc<dyn Directory> =
            Arc::new(LdapDirectory::new(Arc::clone(&live), Arc::clone(&tracker))?);
        Ok(Self::assemble(live, Some(tracker), directory, clock))
    }

    /// Provider over any directory implementation.
    #[must_use]
    pub fn with_directory(config: ProviderConfig, directory: Arc<dyn Directory>, clock: Arc<dyn Clock>) -> Self {
        Self::assemble(Arc::new(LiveConfig::new(config)), None, directory, clock)
    }

    /// Provider over an existing live configuration, e.g. one a
    /// [`crate::config_reload::ConfigWatcher`] updates.
    #[must_use]
    pub fn with_live_config(live: Arc<LiveConfig>, directory: Arc<dyn Directory>, clock: Arc<dyn Clock>) -> Self {
        Self::assemble(live, None, directory, clock)
    }

    fn assemble(
        config: Arc<LiveConfig>,
        tracker: Option<Arc<UrlFailoverTracker>>,
        directory: Arc<dyn Directory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let index = Arc::new(CertificateIndex::new());
        let cache = Arc::new(CertificateCache::new(Arc::clone(&clock)));
        let certificates = CertificateStore::new(
            Arc::clone(&config),
            Arc::clone(&directory),
            Arc::clone(&index),
            Arc::clone(&cache),
        );
        let groups = GroupResolver::new(Arc::clone(&config), Arc::clone(&directory), Arc::clone(&clock));
        let liveness: Arc<dyn ProviderLiveness> = Arc::clone(&config) as Arc<dyn ProviderLiveness>;
        let maintenance = Arc::new(IndexMaintenance::new(
            Arc::clone(&config),
            Arc::clone(&directory),
            index,
            cache,
            liveness,
        ));
        info!(provider = %config.get().name, "Directory identity provider ready");
        Self {
            config,
            tracker,
            directory,
            certificates,
            groups,
            maintenance,
            clock,
        }
    }

    /// Live configuration.
    pub fn config(&self) -> &Arc<LiveConfig> {
        &self.config
    }

    /// Certificate lookups.
    pub fn certificates(&self) -> &CertificateStore {
        &self.certificates
    }

    /// Group resolution.
    pub fn groups(&self) -> &GroupResolver {
        &self.groups
    }

    /// Index rebuild and cache sweep.
    pub fn maintenance(&self) -> &Arc<IndexMaintenance> {
        &self.maintenance
    }

    /// Endpoint tracker, for providers built with [`Self::from_config`].
    pub fn failover(&self) -> Option<&Arc<UrlFailoverTracker>> {
        self.tracker.as_ref()
    }

    /// Start the maintenance tasks; they stop when `shutdown` fires or the
    /// provider is retired.
    pub fn spawn_maintenance(&self, shutdown: &broadcast::Sender<()>) -> MaintenanceHandle {
        Arc::clone(&self.maintenance).spawn(shutdown)
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Authenticate `credentials`.
    ///
    /// Returns `Ok(None)` when no such user exists.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAuthenticated`] when the password or certificate is
    ///   rejected or the account is not usable
    /// - [`Error::Lookup`] when the directory cannot be queried
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Option<User>> {
        match credentials {
            Credentials::Password { login, password } => self.authenticate_password(login, password),
            Credentials::ClientCert { login, certificate } => {
                self.authenticate_certificate(login.as_deref(), certificate)
            }
        }
    }

    fn authenticate_password(&self, login: &str, password: &str) -> Result<Option<User>> {
        if password.is_empty() {
            return Err(Error::NotAuthenticated(format!("empty password for '{login}'")));
        }
        let Some(user) = self.groups.find_user_by_login(login)? else {
            debug!(login = %login, "No such user");
            return Ok(None);
        };
        self.ensure_usable(&user)?;
        match self.directory.bind(&user.dn, password) {
            Ok(()) => {
                info!(user = %user.dn, "Password authentication succeeded");
                Ok(Some(user))
            }
            Err(DirectoryError::AuthenticationFailed(msg)) => {
                info!(user = %user.dn, "Password authentication rejected");
                Err(Error::NotAuthenticated(msg))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn authenticate_certificate(&self, login: Option<&str>, certificate: &[u8]) -> Result<Option<User>> {
        let presented = DecodedCertificate::decode(certificate)?;
        let user = match login {
            Some(login) => self.groups.find_user_by_login(login)?,
            None => match self.certificates.find_by_thumbprint_sha1(presented.thumbprint())? {
                Some(found) => self.groups.find_user_by_dn(&found.subject_dn)?,
                None => None,
            },
        };
        let Some(user) = user else {
            debug!(thumbprint = %presented.thumbprint(), "No user for presented certificate");
            return Ok(None);
        };
        self.ensure_usable(&user)?;

        let config = self.config.get();
        let stored = cert_attributes(&config).iter().any(|attr| {
            user.attributes.binaries(attr).iter().any(|value| {
                DecodedCertificate::decode(value).is_ok_and(|c| c.thumbprint() == presented.thumbprint())
            })
        });
        if stored {
            info!(user = %user.dn, "Certificate authentication succeeded");
            Ok(Some(user))
        } else {
            warn!(user = %user.dn, thumbprint = %presented.thumbprint(), "Presented certificate not stored on user entry");
            Err(Error::NotAuthenticated(format!(
                "certificate not registered for '{}'",
                user.login
            )))
        }
    }

    fn ensure_usable(&self, user: &User) -> Result<()> {
        let status = account_status(&user.attributes, self.clock.now_ms());
        if status.is_valid() {
            Ok(())
        } else {
            info!(user = %user.dn, ?status, "Account not usable");
            Err(Error::NotAuthenticated(format!("account {status:?}")))
        }
    }

    // ========================================================================
    // Delegated queries
    // ========================================================================

    /// User by login name.
    ///
    /// # Errors
    ///
    /// [`Error::Lookup`] when the directory cannot be queried.
    pub fn find_user_by_login(&self, login: &str) -> Result<Option<User>> {
        self.groups.find_user_by_login(login)
    }

    /// Group by common name.
    ///
    /// # Errors
    ///
    /// [`Error::Lookup`] when the directory cannot be queried.
    pub fn find_group_by_name(&self, cn: &str) -> Result<Option<Group>> {
        self.groups.find_group_by_name(cn)
    }

    /// See [`GroupResolver::is_member`].
    ///
    /// # Errors
    ///
    /// [`Error::Lookup`] when the directory cannot be queried.
    pub fn is_member(&self, user: &User, group: &Group) -> Result<bool> {
        self.groups.is_member(user, group)
    }

    /// See [`GroupResolver::get_group_headers`].
    ///
    /// # Errors
    ///
    /// [`Error::Lookup`] when the membership search fails.
    pub fn get_group_headers(&self, user: &User) -> Result<HeaderSet> {
        self.groups.get_group_headers(user)
    }

    /// See [`GroupResolver::get_user_headers`].
    ///
    /// # Errors
    ///
    /// [`Error::Lookup`] when the directory cannot be queried.
    pub fn get_user_headers(&self, group: &Group) -> Result<HeaderSet> {
        self.groups.get_user_headers(group)
    }

    /// See [`GroupResolver::search`].
    ///
    /// # Errors
    ///
    /// [`Error::Lookup`] when the directory cannot be queried.
    pub fn search(&self, kinds: &[EntityKind], pattern: &str) -> Result<HeaderSet> {
        self.groups.search(kinds, pattern)
    }

    /// Certificate by thumbprint; see [`CertificateStore::find_by_thumbprint_sha1`].
    ///
    /// # Errors
    ///
    /// [`Error::Lookup`] when a search-mode query fails.
    pub fn find_cert_by_thumbprint_sha1(&self, thumbprint: &str) -> Result<Option<ResolvedCertificate>> {
        self.certificates.find_by_thumbprint_sha1(thumbprint)
    }

    /// Counters for this provider.
    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            provider: self.config.get().name.clone(),
            index: self.certificates.index().snapshot().sizes(),
            certificate_cache: self.certificates.cache().stats(),
            group_cache: self.groups.stats(),
            endpoints: self.tracker.as_ref().map(|t| t.status()).unwrap_or_default(),
        }
    }
}
