//! TTL cache of resolved groups.
//!
//! Every group is stored twice, under its canonical DN and under its
//! lowercased common name, both keys sharing one [`GroupCacheEntry`]. Expiry
//! is checked on read only. Each entry also remembers member strings proven
//! not to be groups (or neither user nor group), the group's nesting step
//! and, for OU groups, the groups located under the OU, for as long as the
//! entry lives.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::{CacheStats, CacheStatsSnapshot};
use crate::clock::{Clock, duration_ms};
use crate::dn;
use crate::identity::{Group, IdentityHeader};

/// Lookup key; each entry is stored under both forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupCacheKey {
    /// Canonical DN
    Dn(String),
    /// Lowercased common name
    Cn(String),
}

impl GroupCacheKey {
    /// Key for a DN.
    #[must_use]
    pub fn dn(dn: &str) -> Self {
        Self::Dn(dn::canonicalize(dn))
    }

    /// Key for a common name.
    #[must_use]
    pub fn cn(cn: &str) -> Self {
        Self::Cn(cn.to_lowercase())
    }
}

/// Groups found by one directory search, with its truncation flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupList {
    /// Groups found
    pub groups: Vec<IdentityHeader>,
    /// The search hit its result limit
    pub truncated: bool,
}

/// One cached group.
#[derive(Debug)]
pub struct GroupCacheEntry {
    group: Group,
    created_ms: u64,
    non_group_members: RwLock<HashSet<String>>,
    unresolved_members: RwLock<HashSet<String>>,
    subgroups: RwLock<Option<GroupList>>,
    ou_contents: RwLock<Option<GroupList>>,
}

impl GroupCacheEntry {
    /// Entry created at `created_ms`.
    #[must_use]
    pub fn new(group: Group, created_ms: u64) -> Self {
        Self {
            group,
            created_ms,
            non_group_members: RwLock::new(HashSet::new()),
            unresolved_members: RwLock::new(HashSet::new()),
            subgroups: RwLock::new(None),
            ou_contents: RwLock::new(None),
        }
    }

    /// The cached group.
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// When the entry was created (ms since epoch).
    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    fn is_expired(&self, now_ms: u64, max_age_ms: u64) -> bool {
        self.created_ms.saturating_add(max_age_ms) < now_ms
    }

    /// `member` was already shown not to resolve to a group.
    pub fn is_known_non_group(&self, member: &str) -> bool {
        self.non_group_members.read().contains(member)
    }

    /// Remember that `member` does not resolve to a group.
    pub fn record_non_group(&self, member: &str) {
        self.non_group_members.write().insert(member.to_string());
    }

    /// Number of remembered non-group members.
    pub fn non_group_count(&self) -> usize {
        self.non_group_members.read().len()
    }

    /// `member` resolved to neither a user nor a group.
    pub fn is_unresolved(&self, member: &str) -> bool {
        self.unresolved_members.read().contains(member)
    }

    /// Remember that `member` resolves to neither a user nor a group.
    pub fn record_unresolved(&self, member: &str) {
        self.unresolved_members.write().insert(member.to_string());
    }

    /// Number of remembered unresolvable members.
    pub fn unresolved_count(&self) -> usize {
        self.unresolved_members.read().len()
    }

    /// Groups one nesting step away, when already computed.
    pub fn cached_subgroups(&self) -> Option<GroupList> {
        self.subgroups.read().clone()
    }

    /// Remember the groups one nesting step away.
    pub fn set_subgroups(&self, subgroups: GroupList) {
        *self.subgroups.write() = Some(subgroups);
    }

    /// Groups located under this OU, when already searched.
    pub fn cached_ou_contents(&self) -> Option<GroupList> {
        self.ou_contents.read().clone()
    }

    /// Remember the groups located under this OU.
    pub fn set_ou_contents(&self, contents: GroupList) {
        *self.ou_contents.write() = Some(contents);
    }
}

/// Double-indexed group cache with lazy expiry.
pub struct GroupCache {
    entries: DashMap<GroupCacheKey, Arc<GroupCacheEntry>>,
    stats: CacheStats,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for GroupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCache")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl GroupCache {
    /// Empty cache.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            stats: CacheStats::new(),
            clock,
        }
    }

    /// Unexpired entry for a DN.
    pub fn get_by_dn(&self, dn: &str, max_age: Duration) -> Option<Arc<GroupCacheEntry>> {
        self.get(&GroupCacheKey::dn(dn), max_age)
    }

    /// Unexpired entry for a common name.
    pub fn get_by_cn(&self, cn: &str, max_age: Duration) -> Option<Arc<GroupCacheEntry>> {
        self.get(&GroupCacheKey::cn(cn), max_age)
    }

    fn get(&self, key: &GroupCacheKey, max_age: Duration) -> Option<Arc<GroupCacheEntry>> {
        let now = self.clock.now_ms();
        let Some(entry) = self.entries.get(key).map(|e| Arc::clone(e.value())) else {
            self.stats.miss();
            return None;
        };
        if entry.is_expired(now, duration_ms(max_age)) {
            self.entries
                .remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
            self.stats.evicted(1);
            self.stats.miss();
            return None;
        }
        self.stats.hit();
        Some(entry)
    }

    /// Cache `group` under both keys and return its entry.
    ///
    /// `size` is the group capacity; the map holds up to twice as many keys.
    /// With `size` 0 nothing is stored and the entry lives only as long as the
    /// caller holds it.
    pub fn insert(&self, group: Group, size: usize, max_age: Duration) -> Arc<GroupCacheEntry> {
        let dn_key = GroupCacheKey::dn(&group.dn);
        let cn_key = GroupCacheKey::cn(&group.cn);
        let entry = Arc::new(GroupCacheEntry::new(group, self.clock.now_ms()));
        if size == 0 {
            return entry;
        }

        let capacity = size.saturating_mul(2);
        if self.entries.len() + 2 > capacity {
            self.make_room(capacity, max_age);
        }
        self.entries.insert(dn_key, Arc::clone(&entry));
        self.entries.insert(cn_key, Arc::clone(&entry));
        entry
    }

    fn make_room(&self, capacity: usize, max_age: Duration) {
        let now = self.clock.now_ms();
        let max_age_ms = duration_ms(max_age);
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now, max_age_ms));

        while self.entries.len() + 2 > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().created_ms)
                .map(|e| Arc::clone(e.value()));
            let Some(oldest) = oldest else {
                break;
            };
            self.entries.retain(|_, e| !Arc::ptr_eq(e, &oldest));
        }

        let removed = before.saturating_sub(self.entries.len());
        self.stats.evicted(removed);
        debug!(removed, "Evicted group cache keys");
    }

    /// Number of keys (two per group).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.clear();
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

    fn group(dn: &str, cn: &str) -> Group {
        Group {
            provider_id: 1,
            dn: dn.to_string(),
            cn: cn.to_string(),
            attributes: Attributes::new(),
        }
    }

    const AGE: Duration = Duration::from_secs(60);

    #[test]
    fn entries_are_double_indexed() {
        let cache = GroupCache::new(Arc::new(ManualClock::new(0)));
        let entry = cache.insert(group("CN=Admins,DC=x", "Admins"), 10, AGE);
        assert_eq!(cache.len(), 2);

        let by_dn = cache.get_by_dn("cn=admins, dc=x", AGE).unwrap();
        let by_cn = cache.get_by_cn("ADMINS", AGE).unwrap();
        assert!(Arc::ptr_eq(&by_dn, &entry));
        assert!(Arc::ptr_eq(&by_cn, &entry));
    }

    #[test]
    fn expiry_is_checked_on_read() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = GroupCache::new(clock.clone());
        cache.insert(group("cn=g,dc=x", "g"), 10, AGE);

        clock.advance(AGE);
        assert!(cache.get_by_dn("cn=g,dc=x", AGE).is_some());
        clock.advance(Duration::from_millis(1));
        assert!(cache.get_by_dn("cn=g,dc=x", AGE).is_none());
        // the CN key is only dropped when it is read
        assert_eq!(cache.len(), 1);
        assert!(cache.get_by_cn("g", AGE).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn non_group_members_live_with_the_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = GroupCache::new(clock.clone());
        let entry = cache.insert(group("cn=g,dc=x", "g"), 10, AGE);
        entry.record_non_group("cn=ghost,dc=x");

        let again = cache.get_by_cn("g", AGE).unwrap();
        assert!(again.is_known_non_group("cn=ghost,dc=x"));

        clock.advance(AGE * 2);
        let fresh = cache.insert(group("cn=g,dc=x", "g"), 10, AGE);
        assert!(!fresh.is_known_non_group("cn=ghost,dc=x"));
    }

    #[test]
    fn group_lists_keep_their_truncation_flag() {
        let cache = GroupCache::new(Arc::new(ManualClock::new(0)));
        let entry = cache.insert(group("ou=eng,dc=x", "eng"), 10, AGE);
        assert!(entry.cached_subgroups().is_none());
        assert!(entry.cached_ou_contents().is_none());

        let parents = GroupList {
            groups: vec![group("cn=p,dc=x", "p").header()],
            truncated: true,
        };
        entry.set_subgroups(parents.clone());
        entry.set_ou_contents(GroupList::default());
        entry.record_unresolved("cn=ghost,dc=x");

        let again = cache.get_by_dn("ou=eng,dc=x", AGE).unwrap();
        assert_eq!(again.cached_subgroups(), Some(parents));
        assert_eq!(again.cached_ou_contents(), Some(GroupList::default()));
        assert!(again.is_unresolved("cn=ghost,dc=x"));
        assert_eq!(again.unresolved_count(), 1);
    }

    #[test]
    fn capacity_evicts_oldest_group() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = GroupCache::new(clock.clone());
        cache.insert(group("cn=a,dc=x", "a"), 2, AGE);
        clock.advance(Duration::from_secs(1));
        cache.insert(group("cn=b,dc=x", "b"), 2, AGE);
        clock.advance(Duration::from_secs(1));
        cache.insert(group("cn=c,dc=x", "c"), 2, AGE);

        assert_eq!(cache.len(), 4);
        assert!(cache.get_by_cn("a", AGE).is_none());
        assert!(cache.get_by_cn("b", AGE).is_some());
        assert!(cache.get_by_dn("cn=c,dc=x", AGE).is_some());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn zero_size_disables_storage() {
        let cache = GroupCache::new(Arc::new(ManualClock::new(0)));
        let entry = cache.insert(group("cn=a,dc=x", "a"), 0, AGE);
        entry.record_non_group("x");
        assert!(cache.is_empty());
        assert!(cache.get_by_cn("a", AGE).is_none());
    }
}
