//! LDAP directory connector built on `ldap3`.
//!
//! Every operation opens a connection to the endpoint the
//! [`UrlFailoverTracker`] prefers, binds as the service account, runs one
//! request and unbinds. A connection or service bind that fails for reasons
//! other than bad credentials is reported to the tracker and the next
//! endpoint is tried. Rejected credentials never blacklist an endpoint.
//!
//! The synchronous `LdapConn` runs its own runtime; call these methods from
//! plain threads or `tokio::task::spawn_blocking`.

use std::sync::Arc;

use ldap3::{LdapConn, LdapConnSettings, LdapResult, Scope, SearchEntry, SearchOptions};
use tracing::{debug, warn};

use super::{
    Attributes, DirectoryBind, DirectoryEntry, DirectoryEntryFetch, DirectoryError,
    DirectorySearch, SearchRequest, SearchResults,
};
use crate::config::ProviderConfig;
use crate::config_reload::LiveConfig;
use crate::failover::UrlFailoverTracker;
use crate::{Error, Result};

const RC_SUCCESS: u32 = 0;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_FILTER_ERROR: u32 = 87;

/// Directory backed by LDAP servers.
pub struct LdapDirectory {
    config: Arc<LiveConfig>,
    tracker: Arc<UrlFailoverTracker>,
}

impl std::fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("urls", &self.tracker.urls())
            .finish_non_exhaustive()
    }
}

impl LdapDirectory {
    /// Connector for the provider in `config`, selecting endpoints through `tracker`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the TLS settings ask for client certificate
    /// authentication, which this connector cannot present.
    pub fn new(config: Arc<LiveConfig>, tracker: Arc<UrlFailoverTracker>) -> Result<Self> {
        if config.get().tls.client_auth {
            return Err(Error::Config(
                "tls.client_auth is not supported by the LDAP connector".to_string(),
            ));
        }
        Ok(Self { config, tracker })
    }

    fn settings(config: &ProviderConfig) -> LdapConnSettings {
        LdapConnSettings::new()
            .set_conn_timeout(config.tunables.connect_timeout)
            .set_starttls(config.tls.starttls)
            .set_no_tls_verify(!config.tls.verify_hostname)
    }

    fn open(url: &str, config: &ProviderConfig) -> std::result::Result<LdapConn, DirectoryError> {
        LdapConn::with_settings(Self::settings(config), url)
            .map_err(|e| DirectoryError::Unavailable(format!("{url}: {e}")))
    }

    fn bind_service_account(
        conn: &mut LdapConn,
        config: &ProviderConfig,
    ) -> std::result::Result<(), DirectoryError> {
        let dn = config.bind_dn.as_deref().unwrap_or("");
        let password = config.bind_password.as_deref().unwrap_or("");
        let result = conn
            .with_timeout(config.tunables.read_timeout)
            .simple_bind(dn, password)
            .map_err(translate)?;
        check(&result)
    }

    /// Run `op` on a connection to the preferred endpoint, failing over on
    /// connection errors. `bind_service` binds as the service account first.
    fn with_connection<T>(
        &self,
        bind_service: bool,
        mut op: impl FnMut(&mut LdapConn, &ProviderConfig) -> std::result::Result<T, DirectoryError>,
    ) -> std::result::Result<T, DirectoryError> {
        let config = self.config.get();
        self.tracker
            .set_retry_timeout(config.tunables.reconnect_timeout);

        let mut url = self
            .tracker
            .current_url()
            .or_else(|| self.tracker.report_failure_and_advance(None));

        while let Some(current) = url {
            let connected = Self::open(&current, &config).and_then(|mut conn| {
                if bind_service {
                    Self::bind_service_account(&mut conn, &config)?;
                }
                Ok(conn)
            });
            match connected {
                Ok(mut conn) => {
                    debug!(url = %current, "Directory connection established");
                    let result = op(&mut conn, &config);
                    if let Err(e) = conn.unbind() {
                        debug!(url = %current, error = %e, "Unbind failed");
                    }
                    return result;
                }
                Err(DirectoryError::AuthenticationFailed(msg)) => {
                    return Err(DirectoryError::AuthenticationFailed(msg));
                }
                Err(e) => {
                    warn!(url = %current, error = %e, "Directory connection failed");
                    url = self.tracker.report_failure_and_advance(Some(&current));
                }
            }
        }
        Err(DirectoryError::Unavailable(
            "no directory endpoint available".to_string(),
        ))
    }
}

fn translate(err: ldap3::LdapError) -> DirectoryError {
    match err {
        ldap3::LdapError::LdapResult { result } => classify(&result),
        other => DirectoryError::Unavailable(other.to_string()),
    }
}

fn classify(result: &LdapResult) -> DirectoryError {
    match result.rc {
        RC_INVALID_CREDENTIALS => DirectoryError::AuthenticationFailed(result.text.clone()),
        RC_FILTER_ERROR => DirectoryError::InvalidFilter(result.text.clone()),
        51..=53 => DirectoryError::Unavailable(format!("rc={}: {}", result.rc, result.text)),
        code => DirectoryError::Operation {
            code,
            message: result.text.clone(),
        },
    }
}

fn check(result: &LdapResult) -> std::result::Result<(), DirectoryError> {
    if result.rc == RC_SUCCESS {
        Ok(())
    } else {
        Err(classify(result))
    }
}

fn to_entry(entry: SearchEntry) -> DirectoryEntry {
    let mut attributes = Attributes::new();
    for (name, values) in entry.attrs {
        for value in values {
            attributes.push_str(&name, &value);
        }
    }
    for (name, values) in entry.bin_attrs {
        for value in values {
            attributes.push_bytes(&name, value);
        }
    }
    DirectoryEntry {
        dn: entry.dn,
        attributes,
    }
}

fn requested_attributes(wanted: &[String]) -> Vec<String> {
    if wanted.is_empty() {
        vec!["*".to_string()]
    } else {
        wanted.to_vec()
    }
}

impl DirectoryEntryFetch for LdapDirectory {
    fn get_attributes(&self, dn: &str) -> std::result::Result<Option<Attributes>, DirectoryError> {
        self.with_connection(true, |conn, config| {
            let ldap3::SearchResult(entries, result) = conn
                .with_timeout(config.tunables.read_timeout)
                .search(dn, Scope::Base, "(objectClass=*)", vec!["*"])
                .map_err(translate)?;
            match result.rc {
                RC_SUCCESS => Ok(entries
                    .into_iter()
                    .next()
                    .map(|e| to_entry(SearchEntry::construct(e)).attributes)),
                RC_NO_SUCH_OBJECT => Ok(None),
                _ => Err(classify(&result)),
            }
        })
    }
}

impl DirectorySearch for LdapDirectory {
    fn search(&self, request: &SearchRequest) -> std::result::Result<SearchResults, DirectoryError> {
        let filter = request.filter.to_string();
        let attrs = requested_attributes(&request.attributes);
        debug!(base = %request.base, filter = %filter, limit = request.limit, "Directory search");
        self.with_connection(true, |conn, config| {
            conn.with_timeout(config.tunables.read_timeout);
            if request.limit > 0 {
                let limit = i32::try_from(request.limit).unwrap_or(i32::MAX);
                conn.with_search_options(SearchOptions::new().sizelimit(limit));
            }
            let ldap3::SearchResult(entries, result) = conn
                .search(&request.base, Scope::Subtree, &filter, attrs.clone())
                .map_err(translate)?;
            let truncated = match result.rc {
                RC_SUCCESS => false,
                RC_SIZE_LIMIT_EXCEEDED => true,
                RC_NO_SUCH_OBJECT => return Ok(SearchResults::default()),
                _ => return Err(classify(&result)),
            };
            let mut entries: Vec<DirectoryEntry> = entries
                .into_iter()
                .map(|e| to_entry(SearchEntry::construct(e)))
                .collect();
            if request.limit > 0 && entries.len() > request.limit {
                entries.truncate(request.limit);
            }
            Ok(SearchResults { entries, truncated })
        })
    }
}

impl DirectoryBind for LdapDirectory {
    fn bind(&self, dn: &str, password: &str) -> std::result::Result<(), DirectoryError> {
        // An empty password would be an unauthenticated bind, which servers accept.
        if password.is_empty() {
            return Err(DirectoryError::AuthenticationFailed(
                "empty password".to_string(),
            ));
        }
        self.with_connection(false, |conn, config| {
            let result = conn
                .with_timeout(config.tunables.read_timeout)
                .simple_bind(dn, password)
                .map_err(translate)?;
            check(&result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn result(rc: u32, text: &str) -> LdapResult {
        LdapResult {
            rc,
            matched: String::new(),
            text: text.to_string(),
            refs: Vec::new(),
            ctrls: Vec::new(),
        }
    }

    #[test]
    fn result_codes_map_to_error_categories() {
        assert!(matches!(
            classify(&result(49, "bad")),
            DirectoryError::AuthenticationFailed(_)
        ));
        assert!(matches!(classify(&result(87, "")), DirectoryError::InvalidFilter(_)));
        assert!(matches!(classify(&result(52, "")), DirectoryError::Unavailable(_)));
        assert_eq!(
            classify(&result(50, "no access")),
            DirectoryError::Operation {
                code: 50,
                message: "no access".to_string()
            }
        );
        assert!(check(&result(0, "")).is_ok());
    }

    #[test]
    fn search_entries_merge_text_and_binary_attributes() {
        let entry = SearchEntry {
            dn: "uid=a,dc=x".to_string(),
            attrs: HashMap::from([("uid".to_string(), vec!["a".to_string()])]),
            bin_attrs: HashMap::from([(
                "userCertificate;binary".to_string(),
                vec![vec![0x30, 0x00]],
            )]),
        };
        let entry = to_entry(entry);
        assert_eq!(entry.attributes.first_string("UID").as_deref(), Some("a"));
        assert_eq!(entry.attributes.binaries("userCertificate"), &[vec![0x30, 0x00]]);
    }

    #[test]
    fn empty_attribute_list_requests_everything() {
        assert_eq!(requested_attributes(&[]), vec!["*".to_string()]);
        assert_eq!(
            requested_attributes(&["cn".to_string()]),
            vec!["cn".to_string()]
        );
    }
}
