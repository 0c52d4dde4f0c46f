//! Directory collaborator interfaces
//!
//! The core never talks to a directory server directly. It is handed
//! something implementing [`Directory`] (an entry fetch, a filtered search
//! and a simple bind) plus a [`ProviderLiveness`] check. [`ldap::LdapDirectory`]
//! is the production implementation; [`memory::InMemoryDirectory`] serves
//! tests and offline runs.

pub mod filter;
pub mod ldap;
pub mod memory;

use std::collections::BTreeMap;

use thiserror::Error;

pub use filter::Filter;

/// Errors raised by a directory implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// No endpoint reachable, connection dropped or timed out
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// The bind credentials were rejected
    #[error("Directory authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The filter could not be built or parsed
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// The server answered with a failure result code
    #[error("Directory error {code}: {message}")]
    Operation {
        /// LDAP result code
        code: u32,
        /// Diagnostic message
        message: String,
    },
}

impl DirectoryError {
    /// Whether retrying later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Operation { .. })
    }
}

/// Attribute values of one entry. Names compare case-insensitively and
/// transfer options (`;binary`) are stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    values: BTreeMap<String, Vec<Vec<u8>>>,
}

fn attribute_key(name: &str) -> String {
    let base = name.split(';').next().unwrap_or(name);
    base.trim().to_ascii_lowercase()
}

impl Attributes {
    /// Empty attribute set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Attributes::push_str`].
    #[must_use]
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.push_str(name, value);
        self
    }

    /// Builder form of [`Attributes::push_bytes`].
    #[must_use]
    pub fn with_bytes(mut self, name: &str, value: Vec<u8>) -> Self {
        self.push_bytes(name, value);
        self
    }

    /// Append a text value.
    pub fn push_str(&mut self, name: &str, value: &str) {
        self.push_bytes(name, value.as_bytes().to_vec());
    }

    /// Append a binary value.
    pub fn push_bytes(&mut self, name: &str, value: Vec<u8>) {
        self.values.entry(attribute_key(name)).or_default().push(value);
    }

    /// Whether the attribute is present at all.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&attribute_key(name))
    }

    /// Raw values.
    #[must_use]
    pub fn binaries(&self, name: &str) -> &[Vec<u8>] {
        self.values
            .get(&attribute_key(name))
            .map_or(&[], Vec::as_slice)
    }

    /// Values that are valid UTF-8.
    #[must_use]
    pub fn strings(&self, name: &str) -> Vec<String> {
        self.binaries(name)
            .iter()
            .filter_map(|v| std::str::from_utf8(v).ok())
            .map(str::to_string)
            .collect()
    }

    /// First UTF-8 value.
    #[must_use]
    pub fn first_string(&self, name: &str) -> Option<String> {
        self.binaries(name)
            .iter()
            .find_map(|v| std::str::from_utf8(v).ok())
            .map(str::to_string)
    }

    /// Values of `objectClass`.
    #[must_use]
    pub fn object_classes(&self) -> Vec<String> {
        self.strings("objectClass")
    }

    /// Attribute names (lowercased).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Whether any value of `name` equals `value`.
    #[must_use]
    pub fn has_value(&self, name: &str, value: &str, ignore_case: bool) -> bool {
        self.strings(name).iter().any(|v| {
            if ignore_case {
                v.eq_ignore_ascii_case(value)
            } else {
                v == value
            }
        })
    }
}

/// One entry returned by a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name
    pub dn: String,
    /// Attribute values
    pub attributes: Attributes,
}

/// A subtree search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base DN
    pub base: String,
    /// Search filter
    pub filter: Filter,
    /// Maximum entries returned; 0 means no ceiling
    pub limit: usize,
    /// Attributes to return; empty means all
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Search below `base` with no ceiling and all attributes.
    #[must_use]
    pub fn new(base: impl Into<String>, filter: Filter) -> Self {
        Self {
            base: base.into(),
            filter,
            limit: 0,
            attributes: Vec::new(),
        }
    }

    /// Set the result ceiling.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Restrict returned attributes.
    #[must_use]
    pub fn attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Search result; `truncated` is set when the ceiling cut the result short.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResults {
    /// Entries in server order
    pub entries: Vec<DirectoryEntry>,
    /// More entries matched than were returned
    pub truncated: bool,
}

/// Fetch one entry's attributes by DN.
pub trait DirectoryEntryFetch: Send + Sync {
    /// Attributes of `dn`, or `None` when the entry does not exist.
    fn get_attributes(&self, dn: &str) -> Result<Option<Attributes>, DirectoryError>;
}

/// Filtered subtree search.
pub trait DirectorySearch: Send + Sync {
    /// Run `request`. Hitting the ceiling is not an error.
    fn search(&self, request: &SearchRequest) -> Result<SearchResults, DirectoryError>;
}

/// Credential check by simple bind.
pub trait DirectoryBind: Send + Sync {
    /// Bind as `dn`; [`DirectoryError::AuthenticationFailed`] when rejected.
    fn bind(&self, dn: &str, password: &str) -> Result<(), DirectoryError>;
}

/// Everything the core needs from a directory.
pub trait Directory: DirectoryEntryFetch + DirectorySearch + DirectoryBind {}

impl<T: DirectoryEntryFetch + DirectorySearch + DirectoryBind + ?Sized> Directory for T {}

/// Tells background tasks whether their provider configuration still exists.
pub trait ProviderLiveness: Send + Sync {
    /// `Ok(true)` once the configuration was removed or replaced. An error
    /// means the answer is unknown; callers keep running.
    fn is_current_configuration_stale(&self) -> crate::Result<bool>;
}

impl<F> ProviderLiveness for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_current_configuration_stale(&self) -> crate::Result<bool> {
        Ok(self())
    }
}

/// Liveness for providers that are never retired.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCurrent;

impl ProviderLiveness for AlwaysCurrent {
    fn is_current_configuration_stale(&self) -> crate::Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_names_ignore_case_and_options() {
        let attrs = Attributes::new()
            .with("objectClass", "person")
            .with_bytes("userCertificate;binary", vec![1, 2, 3]);
        assert!(attrs.contains("OBJECTCLASS"));
        assert_eq!(attrs.binaries("usercertificate"), &[vec![1, 2, 3]]);
        assert_eq!(attrs.object_classes(), vec!["person".to_string()]);
        assert!(attrs.binaries("missing").is_empty());
    }

    #[test]
    fn strings_skip_binary_values() {
        let attrs = Attributes::new()
            .with_bytes("data", vec![0xff, 0xfe])
            .with("data", "text");
        assert_eq!(attrs.strings("data"), vec!["text".to_string()]);
        assert_eq!(attrs.first_string("data").as_deref(), Some("text"));
    }

    #[test]
    fn has_value_respects_case_flag() {
        let attrs = Attributes::new().with("member", "cn=Bob,dc=x");
        assert!(attrs.has_value("member", "cn=Bob,dc=x", false));
        assert!(!attrs.has_value("member", "cn=bob,dc=x", false));
        assert!(attrs.has_value("member", "cn=bob,dc=x", true));
    }

    #[test]
    fn closures_act_as_liveness() {
        let stale = || true;
        assert!(stale.is_current_configuration_stale().unwrap());
        assert!(!AlwaysCurrent.is_current_configuration_stale().unwrap());
    }
}
