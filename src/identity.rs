//! Users, groups and the headers that name them.
//!
//! Entries are mapped onto [`User`] and [`Group`] through the first
//! matching object-class mapping. Headers are the lightweight form handed
//! back by membership queries; two headers are equal when they have the
//! same kind and name the same DN, whatever the DN's spelling.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::ProviderConfig;
use crate::directory::{Attributes, DirectoryEntry};
use crate::dn;

/// What a header names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A user entry
    User,
    /// A group entry
    Group,
}

/// Reference to a user or group.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityHeader {
    /// User or group
    pub kind: EntityKind,
    /// Distinguished name, as the directory spelled it
    pub dn: String,
    /// Display name (user) or common name (group)
    pub name: String,
    /// Login name, users only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(skip)]
    key: String,
}

impl IdentityHeader {
    /// Header for a user.
    #[must_use]
    pub fn user(dn: impl Into<String>, name: impl Into<String>, login: impl Into<String>) -> Self {
        Self::build(EntityKind::User, dn.into(), name.into(), Some(login.into()))
    }

    /// Header for a group.
    #[must_use]
    pub fn group(dn: impl Into<String>, name: impl Into<String>) -> Self {
        Self::build(EntityKind::Group, dn.into(), name.into(), None)
    }

    fn build(kind: EntityKind, dn: String, name: String, login: Option<String>) -> Self {
        let key = dn::canonicalize(&dn);
        Self {
            kind,
            dn,
            name,
            login,
            key,
        }
    }

    /// Canonical DN used for equality.
    #[must_use]
    pub fn canonical_dn(&self) -> &str {
        &self.key
    }
}

impl PartialEq for IdentityHeader {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.key == other.key
    }
}

impl Eq for IdentityHeader {}

impl PartialOrd for IdentityHeader {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdentityHeader {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// A de-duplicated set of headers plus a marker for incomplete results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeaderSet {
    headers: BTreeSet<IdentityHeader>,
    truncated: bool,
}

impl HeaderSet {
    /// Empty, complete set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header; `false` when it was already present.
    pub fn insert(&mut self, header: IdentityHeader) -> bool {
        self.headers.insert(header)
    }

    /// Whether a header of `kind` for `dn` is present.
    #[must_use]
    pub fn contains(&self, kind: EntityKind, dn: &str) -> bool {
        let key = dn::canonicalize(dn);
        self.headers.iter().any(|h| h.kind == kind && h.key == key)
    }

    /// Merge `other`, carrying its truncation marker.
    pub fn merge(&mut self, other: HeaderSet) {
        self.truncated |= other.truncated;
        self.headers.extend(other.headers);
    }

    /// Record that some directory search hit its ceiling.
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    /// The set is incomplete.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// No headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Headers in kind-then-DN order.
    pub fn iter(&self) -> impl Iterator<Item = &IdentityHeader> {
        self.headers.iter()
    }
}

impl<'a> IntoIterator for &'a HeaderSet {
    type Item = &'a IdentityHeader;
    type IntoIter = std::collections::btree_set::Iter<'a, IdentityHeader>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}

/// A user resolved from the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Identity of the provider that resolved it
    pub provider_id: u64,
    /// Distinguished name
    pub dn: String,
    /// Login name
    pub login: String,
    /// Display name
    pub name: String,
    /// Entry attributes
    pub attributes: Attributes,
}

impl User {
    /// Header naming this user.
    #[must_use]
    pub fn header(&self) -> IdentityHeader {
        IdentityHeader::user(&self.dn, &self.name, &self.login)
    }
}

/// A group resolved from the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Identity of the provider that resolved it
    pub provider_id: u64,
    /// Distinguished name
    pub dn: String,
    /// Common name
    pub cn: String,
    /// Entry attributes
    pub attributes: Attributes,
}

impl Group {
    /// Header naming this group.
    #[must_use]
    pub fn header(&self) -> IdentityHeader {
        IdentityHeader::group(&self.dn, &self.cn)
    }
}

/// Map an entry onto a user through the first matching user mapping.
#[must_use]
pub fn user_from_entry(config: &ProviderConfig, entry: &DirectoryEntry) -> Option<User> {
    let mapping = config.user_mapping_for(&entry.attributes.object_classes())?;
    let login = entry.attributes.first_string(&mapping.login_attr)?;
    let name = entry
        .attributes
        .first_string(&mapping.name_attr)
        .or_else(|| dn::leading_rdn_value(&entry.dn))
        .unwrap_or_else(|| login.clone());
    Some(User {
        provider_id: config.id,
        dn: entry.dn.clone(),
        login,
        name,
        attributes: entry.attributes.clone(),
    })
}

/// Map an entry onto a group through the first matching group mapping.
#[must_use]
pub fn group_from_entry(config: &ProviderConfig, entry: &DirectoryEntry) -> Option<Group> {
    let mapping = config.group_mapping_for(&entry.attributes.object_classes())?;
    let cn = entry
        .attributes
        .first_string(&mapping.name_attr)
        .or_else(|| dn::leading_rdn_value(&entry.dn))?;
    Some(Group {
        provider_id: config.id,
        dn: entry.dn.clone(),
        cn,
        attributes: entry.attributes.clone(),
    })
}

// ============================================================================
// Account status
// ============================================================================

const UAC_ACCOUNT_DISABLE: u64 = 0x2;
const UAC_LOCKOUT: u64 = 0x10;
const UAC_PASSWORD_EXPIRED: u64 = 0x0080_0000;

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: i64 = 116_444_736_000_000_000;
const FILETIME_NEVER: i64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Whether an account may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Usable
    Valid,
    /// `userAccountControl` has ACCOUNTDISABLE
    Disabled,
    /// `userAccountControl` has LOCKOUT
    Locked,
    /// `userAccountControl` has PASSWORD_EXPIRED
    PasswordExpired,
    /// `accountExpires` lies in the past
    Expired,
}

impl AccountStatus {
    /// Usable.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }
}

/// Evaluate the Active Directory account attributes of an entry at `now_ms`.
///
/// Entries without those attributes are valid.
#[must_use]
pub fn account_status(attributes: &Attributes, now_ms: u64) -> AccountStatus {
    if let Some(uac) = attributes
        .first_string("userAccountControl")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        if uac & UAC_ACCOUNT_DISABLE != 0 {
            return AccountStatus::Disabled;
        }
        if uac & UAC_LOCKOUT != 0 {
            return AccountStatus::Locked;
        }
        if uac & UAC_PASSWORD_EXPIRED != 0 {
            return AccountStatus::PasswordExpired;
        }
    }
    if let Some(expires) = attributes
        .first_string("accountExpires")
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        if expires != 0 && expires != FILETIME_NEVER {
            let expires_ms = (expires - FILETIME_UNIX_EPOCH) / 10_000;
            if i64::try_from(now_ms).is_ok_and(|now| now >= expires_ms) {
                return AccountStatus::Expired;
            }
        }
    }
    AccountStatus::Valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupMapping, MemberStrategy, UserMapping};

    fn config() -> ProviderConfig {
        ProviderConfig {
            id: 7,
            user_mappings: vec![UserMapping {
                object_class: "person".to_string(),
                login_attr: "uid".to_string(),
                name_attr: "displayName".to_string(),
                cert_attr: None,
            }],
            group_mappings: vec![GroupMapping {
                object_class: "groupOfNames".to_string(),
                name_attr: "cn".to_string(),
                member_attr: "member".to_string(),
                member_strategy: MemberStrategy::MembersAreDn,
            }],
            ..ProviderConfig::default()
        }
    }

    fn entry(dn: &str, attributes: Attributes) -> DirectoryEntry {
        DirectoryEntry {
            dn: dn.to_string(),
            attributes,
        }
    }

    #[test]
    fn headers_compare_by_canonical_dn() {
        let a = IdentityHeader::group("CN=Admins, DC=X", "Admins");
        let b = IdentityHeader::group("cn=admins,dc=x", "admins");
        assert_eq!(a, b);

        let mut set = HeaderSet::new();
        assert!(set.insert(a));
        assert!(!set.insert(b));
        assert!(!set.insert(IdentityHeader::group("cn=admins,dc=x", "x")));
        assert!(set.insert(IdentityHeader::user("cn=admins,dc=x", "x", "x")));
        assert_eq!(set.len(), 2);
        assert!(set.contains(EntityKind::Group, "cn=ADMINS,dc=x"));
    }

    #[test]
    fn merge_carries_truncation() {
        let mut a = HeaderSet::new();
        let mut b = HeaderSet::new();
        b.insert(IdentityHeader::group("cn=g,dc=x", "g"));
        b.mark_truncated();
        a.merge(b);
        assert!(a.is_truncated());
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn user_mapping_fills_fields() {
        let e = entry(
            "cn=bob,dc=x",
            Attributes::new()
                .with("objectClass", "Person")
                .with("uid", "bob")
                .with("displayName", "Bob B"),
        );
        let user = user_from_entry(&config(), &e).unwrap();
        assert_eq!(user.provider_id, 7);
        assert_eq!(user.login, "bob");
        assert_eq!(user.name, "Bob B");

        let no_login = entry("cn=eve,dc=x", Attributes::new().with("objectClass", "person"));
        assert!(user_from_entry(&config(), &no_login).is_none());
    }

    #[test]
    fn group_name_falls_back_to_rdn() {
        let e = entry("cn=Staff,dc=x", Attributes::new().with("objectClass", "groupOfNames"));
        assert_eq!(group_from_entry(&config(), &e).unwrap().cn, "Staff");

        let not_group = entry("cn=bob,dc=x", Attributes::new().with("objectClass", "person"));
        assert!(group_from_entry(&config(), &not_group).is_none());
    }

    #[test]
    fn user_account_control_flags() {
        let attrs = |uac: &str| Attributes::new().with("userAccountControl", uac);
        assert_eq!(account_status(&attrs("512"), 0), AccountStatus::Valid);
        assert_eq!(account_status(&attrs("514"), 0), AccountStatus::Disabled);
        assert_eq!(account_status(&attrs("528"), 0), AccountStatus::Locked);
        assert_eq!(account_status(&attrs("8389120"), 0), AccountStatus::PasswordExpired);
        assert_eq!(account_status(&Attributes::new(), 0), AccountStatus::Valid);
    }

    #[test]
    fn account_expiry_uses_filetime() {
        // 2024-01-01T00:00:00Z
        let expires_ms: i64 = 1_704_067_200_000;
        let filetime = expires_ms * 10_000 + FILETIME_UNIX_EPOCH;
        let attrs = Attributes::new().with("accountExpires", &filetime.to_string());

        assert_eq!(account_status(&attrs, 1_704_067_199_000), AccountStatus::Valid);
        assert_eq!(account_status(&attrs, 1_704_067_200_000), AccountStatus::Expired);

        let never = Attributes::new().with("accountExpires", "9223372036854775807");
        assert_eq!(account_status(&never, u64::MAX), AccountStatus::Valid);
        let zero = Attributes::new().with("accountExpires", "0");
        assert_eq!(account_status(&zero, 1_704_067_200_000), AccountStatus::Valid);
    }
}
