//! Provider configuration
//!
//! One YAML document describes one directory identity provider: its
//! endpoints, bind identity, TLS settings, schema mappings and tunables.
//! Values may be overridden with `DIRGATE_`-prefixed environment variables
//! (`__` separates nested keys, e.g. `DIRGATE_TUNABLES__GROUP_MAX_NESTING=3`).

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::directory::filter::{Filter, expand_template};
use crate::{Error, Result};

/// Smallest accepted index rebuild interval and certificate cache lifetime.
pub const MIN_CERT_INTERVAL: Duration = Duration::from_secs(10);

/// Placeholders accepted in certificate search filter templates.
pub const CERT_TEMPLATE_PLACEHOLDERS: &[&str] = &["issuer", "serial", "ski", "thumbprint", "subject"];

/// Directory identity provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Display name, used in logs
    pub name: String,
    /// Provider identity; users and groups carry it
    pub id: u64,
    /// Directory endpoints in order of preference
    pub urls: Vec<String>,
    /// Base DN for every search
    pub search_base: String,
    /// Service account DN used for searches (anonymous when absent)
    pub bind_dn: Option<String>,
    /// Service account password; `${VAR}` is expanded from the environment
    pub bind_password: Option<String>,
    /// TLS settings handed to the directory connector
    pub tls: TlsSettings,
    /// User object class mappings, first match wins
    pub user_mappings: Vec<UserMapping>,
    /// Group object class mappings, first match wins
    pub group_mappings: Vec<GroupMapping>,
    /// Certificate lookup settings
    pub certificates: CertificateSettings,
    /// Compare member attribute values case-insensitively
    pub group_membership_case_insensitive: bool,
    /// Name attribute used for NV-pair members instead of the user mappings' name attributes
    pub member_nv_pair_attribute: Option<String>,
    /// Hot-reloadable tunables
    pub tunables: Tunables,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "ldap".to_string(),
            id: 0,
            urls: Vec::new(),
            search_base: String::new(),
            bind_dn: None,
            bind_password: None,
            tls: TlsSettings::default(),
            user_mappings: Vec::new(),
            group_mappings: Vec::new(),
            certificates: CertificateSettings::default(),
            group_membership_case_insensitive: false,
            member_nv_pair_attribute: None,
            tunables: Tunables::default(),
        }
    }
}

/// TLS parameters for directory connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Upgrade plain `ldap://` connections with StartTLS
    pub starttls: bool,
    /// Verify the server certificate and host name
    pub verify_hostname: bool,
    /// Present a client certificate
    pub client_auth: bool,
    /// Keystore holding the client certificate
    pub keystore: Option<PathBuf>,
    /// Key alias inside the keystore
    pub key_alias: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            starttls: false,
            verify_hostname: true,
            client_auth: false,
            keystore: None,
            key_alias: None,
        }
    }
}

/// Maps a user object class onto attribute names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMapping {
    /// Object class value identifying user entries
    pub object_class: String,
    /// Attribute holding the login name
    pub login_attr: String,
    /// Attribute holding the display/common name
    #[serde(default = "default_name_attr")]
    pub name_attr: String,
    /// Attribute holding X.509 certificates
    #[serde(default)]
    pub cert_attr: Option<String>,
}

/// Maps a group object class onto attribute names and a membership strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMapping {
    /// Object class value identifying group entries
    pub object_class: String,
    /// Attribute holding the group name
    #[serde(default = "default_name_attr")]
    pub name_attr: String,
    /// Attribute listing members (unused for `members_by_ou`)
    #[serde(default)]
    pub member_attr: String,
    /// How member values are interpreted
    pub member_strategy: MemberStrategy,
}

fn default_name_attr() -> String {
    "cn".to_string()
}

/// Interpretation of a group's membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStrategy {
    /// Users are members when their DN lies below the group DN
    MembersByOu,
    /// Member values are user login names
    MembersAreLogin,
    /// Member values are distinguished names
    MembersAreDn,
    /// Member values are `attr=value` pairs
    MembersAreNvPair,
}

/// How certificates are located in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateMode {
    /// No directory certificate lookups
    #[default]
    Disabled,
    /// Periodically rebuilt in-memory index
    Index,
    /// One directory search per lookup
    Search,
}

/// Certificate lookup settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateSettings {
    /// Lookup mode
    pub mode: CertificateMode,
    /// Replaces the `(certAttr=*)` scan filter used by index rebuilds
    pub index_filter: Option<String>,
    /// Search-mode filter templates, one per lookup facet
    pub search_filters: CertSearchFilters,
}

/// Search-mode filter templates. `{issuer}`, `{serial}`, `{ski}`,
/// `{thumbprint}` and `{subject}` are replaced with escaped values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertSearchFilters {
    /// Filter for issuer DN plus serial lookups
    pub issuer_serial: Option<String>,
    /// Filter for subject key identifier lookups
    pub ski: Option<String>,
    /// Filter for thumbprint lookups
    pub thumbprint: Option<String>,
    /// Filter for subject DN lookups
    pub subject: Option<String>,
}

impl CertSearchFilters {
    fn all(&self) -> impl Iterator<Item = (&'static str, &String)> {
        [
            ("issuer_serial", self.issuer_serial.as_ref()),
            ("ski", self.ski.as_ref()),
            ("thumbprint", self.thumbprint.as_ref()),
            ("subject", self.subject.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, t)| t.map(|t| (name, t)))
    }
}

/// Tunables re-read on every use, so a config reload takes effect without restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// How often the certificate index is rebuilt
    #[serde(with = "humantime_serde")]
    pub index_rebuild_interval: Duration,
    /// How often expired certificate cache entries are swept
    #[serde(with = "humantime_serde")]
    pub cert_cache_cleanup_interval: Duration,
    /// Lifetime of a cached certificate
    #[serde(with = "humantime_serde")]
    pub cached_cert_entry_lifetime: Duration,
    /// Delay before the first maintenance run
    #[serde(with = "humantime_serde")]
    pub maintenance_initial_delay: Duration,
    /// Number of groups cached; 0 disables the group cache
    pub group_cache_size: usize,
    /// Lifetime of a cached group
    #[serde(with = "humantime_serde")]
    pub group_cache_max_age: Duration,
    /// Maximum nesting depth; 0 is unlimited and 1 disables nesting
    pub group_max_nesting: u32,
    /// Result ceiling for user and generic searches
    pub max_search_results: usize,
    /// Result ceiling for group membership searches
    pub max_group_search_results: usize,
    /// How long a failed endpoint stays blacklisted
    #[serde(with = "humantime_serde")]
    pub reconnect_timeout: Duration,
    /// Directory connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Directory operation timeout
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            index_rebuild_interval: Duration::from_secs(600),
            cert_cache_cleanup_interval: Duration::from_secs(600),
            cached_cert_entry_lifetime: Duration::from_secs(600),
            maintenance_initial_delay: Duration::from_secs(5),
            group_cache_size: 100,
            group_cache_max_age: Duration::from_secs(60),
            group_max_nesting: 0,
            max_search_results: 100,
            max_group_search_results: 100,
            reconnect_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl Tunables {
    /// Rebuild interval, falling back to the default when below the minimum.
    #[must_use]
    pub fn effective_index_rebuild_interval(&self) -> Duration {
        clamp_to_minimum(
            "index_rebuild_interval",
            self.index_rebuild_interval,
            Self::default().index_rebuild_interval,
        )
    }

    /// Certificate cache lifetime, falling back to the default when below the minimum.
    #[must_use]
    pub fn effective_cert_entry_lifetime(&self) -> Duration {
        clamp_to_minimum(
            "cached_cert_entry_lifetime",
            self.cached_cert_entry_lifetime,
            Self::default().cached_cert_entry_lifetime,
        )
    }

    /// Sweep interval; zero falls back to the default.
    #[must_use]
    pub fn effective_cache_cleanup_interval(&self) -> Duration {
        if self.cert_cache_cleanup_interval.is_zero() {
            Self::default().cert_cache_cleanup_interval
        } else {
            self.cert_cache_cleanup_interval
        }
    }

    /// Whether a membership walk at `depth` may descend one more level.
    #[must_use]
    pub fn process_next_depth(&self, depth: u32) -> bool {
        self.group_max_nesting == 0 || depth < self.group_max_nesting
    }

    /// Nested groups are considered at all.
    #[must_use]
    pub fn group_nesting_enabled(&self) -> bool {
        self.group_max_nesting != 1
    }
}

fn clamp_to_minimum(name: &str, value: Duration, default: Duration) -> Duration {
    if value < MIN_CERT_INTERVAL {
        warn!(
            setting = name,
            configured = ?value,
            fallback = ?default,
            "Value below minimum, using default"
        );
        default
    } else {
        value
    }
}

impl ProviderConfig {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("DIRGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}` in the bind credentials
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;
        let expand = |value: &str| -> String {
            re.replace_all(value, |caps: &regex::Captures<'_>| {
                let var = &caps[1];
                env::var(var).unwrap_or_else(|_| {
                    caps.get(2).map_or_else(String::new, |d| d.as_str().to_string())
                })
            })
            .into_owned()
        };
        if let Some(dn) = &self.bind_dn {
            self.bind_dn = Some(expand(dn));
        }
        if let Some(pw) = &self.bind_password {
            self.bind_password = Some(expand(pw));
        }
        Ok(())
    }

    /// Check the configuration for mistakes that would only surface at lookup time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(Error::Config(format!(
                "provider '{}' has no directory urls",
                self.name
            )));
        }
        for raw in &self.urls {
            let url = Url::parse(raw)
                .map_err(|e| Error::Config(format!("unparseable directory url '{raw}': {e}")))?;
            if !matches!(url.scheme(), "ldap" | "ldaps") {
                return Err(Error::Config(format!(
                    "directory url '{raw}' must use ldap:// or ldaps://"
                )));
            }
        }
        if self.user_mappings.is_empty() {
            return Err(Error::Config(format!(
                "provider '{}' has no user mappings",
                self.name
            )));
        }
        for mapping in &self.user_mappings {
            if mapping.object_class.is_empty() || mapping.login_attr.is_empty() {
                return Err(Error::Config(
                    "user mapping needs object_class and login_attr".to_string(),
                ));
            }
        }
        for mapping in &self.group_mappings {
            if mapping.object_class.is_empty() {
                return Err(Error::Config("group mapping needs object_class".to_string()));
            }
            if mapping.member_strategy != MemberStrategy::MembersByOu && mapping.member_attr.is_empty() {
                return Err(Error::Config(format!(
                    "group mapping '{}' needs member_attr",
                    mapping.object_class
                )));
            }
        }
        if self.tls.client_auth && self.tls.keystore.is_none() {
            return Err(Error::Config(
                "tls.client_auth requires tls.keystore".to_string(),
            ));
        }
        self.validate_certificate_settings()
    }

    fn validate_certificate_settings(&self) -> Result<()> {
        let certs = &self.certificates;
        if certs.mode == CertificateMode::Index
            && certs.index_filter.is_none()
            && self.user_mappings.iter().all(|m| m.cert_attr.is_none())
        {
            return Err(Error::Config(
                "certificate index mode needs a user mapping with cert_attr or an index_filter"
                    .to_string(),
            ));
        }
        if let Some(filter) = &certs.index_filter {
            Filter::parse(filter)?;
        }
        for (facet, template) in certs.search_filters.all() {
            let probe: Vec<(&str, &str)> = CERT_TEMPLATE_PLACEHOLDERS
                .iter()
                .map(|p| (*p, "x"))
                .collect();
            let expanded = expand_template(template, &probe)
                .map_err(|e| Error::Config(format!("search_filters.{facet}: {e}")))?;
            Filter::parse(&expanded)
                .map_err(|e| Error::Config(format!("search_filters.{facet}: {e}")))?;
        }
        Ok(())
    }

    /// First user mapping whose object class appears in `object_classes`.
    #[must_use]
    pub fn user_mapping_for(&self, object_classes: &[String]) -> Option<&UserMapping> {
        self.user_mappings
            .iter()
            .find(|m| object_classes.iter().any(|oc| oc.eq_ignore_ascii_case(&m.object_class)))
    }

    /// First group mapping whose object class appears in `object_classes`.
    #[must_use]
    pub fn group_mapping_for(&self, object_classes: &[String]) -> Option<&GroupMapping> {
        self.group_mappings
            .iter()
            .find(|m| object_classes.iter().any(|oc| oc.eq_ignore_ascii_case(&m.object_class)))
    }

    /// Any group mapping uses OU containment.
    #[must_use]
    pub fn has_ou_strategy(&self) -> bool {
        self.group_mappings
            .iter()
            .any(|m| m.member_strategy == MemberStrategy::MembersByOu)
    }

    /// Distinct name attributes used to build NV-pair member values.
    #[must_use]
    pub fn nv_pair_name_attributes(&self) -> Vec<String> {
        if let Some(attr) = &self.member_nv_pair_attribute {
            return vec![attr.clone()];
        }
        let mut names: Vec<String> = Vec::new();
        for mapping in &self.user_mappings {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&mapping.name_attr)) {
                names.push(mapping.name_attr.clone());
            }
        }
        names
    }

    /// Certificate attributes across all user mappings.
    #[must_use]
    pub fn cert_attributes(&self) -> Vec<String> {
        self.user_mappings
            .iter()
            .filter_map(|m| m.cert_attr.clone())
            .collect()
    }
}

/// Serde helper for `Duration` as a human-readable string ("30s", "10m", "100ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a duration string (e.g., "30s", "5m", "100ms"); bare numbers are seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string.
    ///
    /// # Errors
    ///
    /// Returns the parse error message.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parsed = if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        };
        parsed.map_err(|e| format!("invalid duration '{s}': {e}"))
    }
}
