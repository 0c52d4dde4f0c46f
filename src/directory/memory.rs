//! In-process directory.
//!
//! Holds entries in a map keyed by canonical DN and evaluates [`Filter`]
//! trees against them. Every fetch and search is counted, and an outage can
//! be switched on, which makes caching and failure handling observable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::{
    Attributes, DirectoryBind, DirectoryEntry, DirectoryEntryFetch, DirectoryError,
    DirectorySearch, Filter, SearchRequest, SearchResults,
};
use crate::dn;

/// In-memory directory implementation.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: RwLock<BTreeMap<String, DirectoryEntry>>,
    passwords: RwLock<HashMap<String, String>>,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
    searches: AtomicUsize,
}

impl InMemoryDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn add_entry(&self, dn: &str, attributes: Attributes) {
        self.entries.write().insert(
            dn::canonicalize(dn),
            DirectoryEntry {
                dn: dn.to_string(),
                attributes,
            },
        );
    }

    /// Remove an entry; returns whether it existed.
    pub fn remove_entry(&self, dn: &str) -> bool {
        self.entries.write().remove(&dn::canonicalize(dn)).is_some()
    }

    /// Set the password accepted by [`DirectoryBind::bind`] for `dn`.
    pub fn set_password(&self, dn: &str, password: &str) {
        self.passwords
            .write()
            .insert(dn::canonicalize(dn), password.to_string());
    }

    /// Make every operation fail with [`DirectoryError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of entry fetches served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of searches served.
    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    /// Fetches plus searches.
    pub fn call_count(&self) -> usize {
        self.fetch_count() + self.search_count()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_available(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DirectoryError::Unavailable(
                "in-memory directory is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl DirectoryEntryFetch for InMemoryDirectory {
    fn get_attributes(&self, dn: &str) -> Result<Option<Attributes>, DirectoryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .entries
            .read()
            .get(&dn::canonicalize(dn))
            .map(|e| e.attributes.clone()))
    }
}

impl DirectorySearch for InMemoryDirectory {
    fn search(&self, request: &SearchRequest) -> Result<SearchResults, DirectoryError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let entries = self.entries.read();
        let mut results = SearchResults::default();
        for entry in entries.values() {
            if !dn::is_descendant(&entry.dn, &request.base) || !matches(&request.filter, &entry.attributes) {
                continue;
            }
            if request.limit > 0 && results.entries.len() >= request.limit {
                results.truncated = true;
                break;
            }
            results.entries.push(project(entry, &request.attributes));
        }
        Ok(results)
    }
}

impl DirectoryBind for InMemoryDirectory {
    fn bind(&self, dn: &str, password: &str) -> Result<(), DirectoryError> {
        self.check_available()?;
        match self.passwords.read().get(&dn::canonicalize(dn)) {
            Some(expected) if expected == password && !password.is_empty() => Ok(()),
            _ => Err(DirectoryError::AuthenticationFailed(format!(
                "invalid credentials for {dn}"
            ))),
        }
    }
}

fn project(entry: &DirectoryEntry, wanted: &[String]) -> DirectoryEntry {
    if wanted.is_empty() {
        return entry.clone();
    }
    let mut attributes = Attributes::new();
    for name in wanted {
        for value in entry.attributes.binaries(name) {
            attributes.push_bytes(name, value.clone());
        }
    }
    DirectoryEntry {
        dn: entry.dn.clone(),
        attributes,
    }
}

/// Evaluate `filter` against one entry. Value comparison ignores case.
#[must_use]
pub fn matches(filter: &Filter, attributes: &Attributes) -> bool {
    match filter {
        Filter::And(children) => children.iter().all(|c| matches(c, attributes)),
        Filter::Or(children) => children.iter().any(|c| matches(c, attributes)),
        Filter::Not(child) => !matches(child, attributes),
        Filter::Present(attr) => attributes.contains(attr),
        Filter::Equals { attr, value } => attributes.has_value(attr, value, true),
        Filter::Substring { attr, parts } => attributes
            .strings(attr)
            .iter()
            .any(|v| wildcard_match(&v.to_lowercase(), parts)),
    }
}

fn wildcard_match(value: &str, parts: &[String]) -> bool {
    let parts: Vec<String> = parts.iter().map(|p| p.to_lowercase()).collect();
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    let Some(mut remaining) = value.strip_prefix(first.as_str()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        match remaining.find(part.as_str()) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(uid: &str) -> Attributes {
        Attributes::new()
            .with("objectClass", "inetOrgPerson")
            .with("uid", uid)
            .with("cn", &format!("{uid} user"))
    }

    #[test]
    fn search_is_scoped_to_base() {
        let dir = InMemoryDirectory::new();
        dir.add_entry("uid=a,ou=eng,dc=x", person("a"));
        dir.add_entry("uid=b,ou=ops,dc=x", person("b"));

        let req = SearchRequest::new("ou=eng,dc=x", Filter::present("uid"));
        let res = dir.search(&req).unwrap();
        assert_eq!(res.entries.len(), 1);
        assert_eq!(res.entries[0].dn, "uid=a,ou=eng,dc=x");
        assert!(!res.truncated);
    }

    #[test]
    fn limit_marks_truncation() {
        let dir = InMemoryDirectory::new();
        for uid in ["a", "b", "c"] {
            dir.add_entry(&format!("uid={uid},dc=x"), person(uid));
        }
        let res = dir
            .search(&SearchRequest::new("dc=x", Filter::present("uid")).limit(2))
            .unwrap();
        assert_eq!(res.entries.len(), 2);
        assert!(res.truncated);

        let res = dir
            .search(&SearchRequest::new("dc=x", Filter::present("uid")).limit(3))
            .unwrap();
        assert!(!res.truncated);
    }

    #[test]
    fn wildcards_and_case() {
        let attrs = person("Bob");
        assert!(matches(&Filter::pattern("cn", "bo*"), &attrs));
        assert!(matches(&Filter::pattern("cn", "*USER"), &attrs));
        assert!(matches(&Filter::pattern("cn", "b*b*r"), &attrs));
        assert!(!matches(&Filter::pattern("cn", "bob*x"), &attrs));
        assert!(matches(&Filter::eq("uid", "BOB"), &attrs));
        assert!(!matches(&Filter::not(Filter::present("uid")), &attrs));
        // overlapping prefix and suffix
        let short = Attributes::new().with("cn", "ab");
        assert!(!matches(&Filter::pattern("cn", "ab*b"), &short));
    }

    #[test]
    fn outage_fails_and_counts() {
        let dir = InMemoryDirectory::new();
        dir.add_entry("uid=a,dc=x", person("a"));
        dir.set_unavailable(true);
        assert!(matches!(
            dir.get_attributes("uid=a,dc=x"),
            Err(DirectoryError::Unavailable(_))
        ));
        dir.set_unavailable(false);
        assert!(dir.get_attributes("UID=A, DC=X").unwrap().is_some());
        assert!(dir.get_attributes("uid=zz,dc=x").unwrap().is_none());
        assert_eq!(dir.fetch_count(), 3);
    }

    #[test]
    fn bind_checks_password() {
        let dir = InMemoryDirectory::new();
        dir.set_password("uid=a,dc=x", "secret");
        assert!(dir.bind("uid=a,dc=x", "secret").is_ok());
        assert!(matches!(
            dir.bind("uid=a,dc=x", "wrong"),
            Err(DirectoryError::AuthenticationFailed(_))
        ));
        assert!(dir.bind("uid=a,dc=x", "").is_err());
    }

    #[test]
    fn projection_keeps_requested_attributes() {
        let dir = InMemoryDirectory::new();
        dir.add_entry("uid=a,dc=x", person("a"));
        let res = dir
            .search(
                &SearchRequest::new("dc=x", Filter::present("uid"))
                    .attributes(vec!["uid".to_string()]),
            )
            .unwrap();
        let attrs = &res.entries[0].attributes;
        assert!(attrs.contains("uid"));
        assert!(!attrs.contains("cn"));
    }
}
