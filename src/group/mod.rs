//! Nested group resolution.
//!
//! [`GroupResolver`] answers membership questions in both directions:
//! which groups a user belongs to, and which users a group contains. Each
//! group object class declares one [`MemberStrategy`]; attribute-based
//! strategies may also name nested groups, which are followed up to the
//! configured nesting depth.
//!
//! Depth counting starts at 1 for the group a query begins with.
//! `group_max_nesting` of 0 means unlimited, 1 means flat groups only and
//! any other N stops before depth N + 1. A group already visited in the
//! current walk is never entered twice, so cyclic directories terminate
//! even with unlimited nesting.
//!
//! No lock is held across recursion. Concurrent walks over overlapping
//! groups may repeat directory work but cannot deadlock.

pub mod cache;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::CacheStatsSnapshot;
use crate::clock::Clock;
use crate::config::{MemberStrategy, ProviderConfig};
use crate::config_reload::LiveConfig;
use crate::directory::filter::{group_search_filter, user_login_filter, user_search_filter};
use crate::directory::{Directory, DirectoryEntry, Filter, SearchRequest};
use crate::dn;
use crate::identity::{EntityKind, Group, HeaderSet, IdentityHeader, User, account_status, group_from_entry, user_from_entry};
use crate::Result;

pub use cache::{GroupCache, GroupCacheEntry, GroupCacheKey, GroupList};

/// Membership queries over one provider's directory.
pub struct GroupResolver {
    config: Arc<LiveConfig>,
    directory: Arc<dyn Directory>,
    cache: GroupCache,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for GroupResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl GroupResolver {
    /// Resolver with an empty group cache.
    #[must_use]
    pub fn new(config: Arc<LiveConfig>, directory: Arc<dyn Directory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            directory,
            cache: GroupCache::new(Arc::clone(&clock)),
            clock,
        }
    }

    /// The group cache.
    pub fn cache(&self) -> &GroupCache {
        &self.cache
    }

    /// Group cache counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Group with the given DN.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the directory cannot be queried.
    pub fn find_group_by_dn(&self, dn: &str) -> Result<Option<Group>> {
        let config = self.config.get();
        Ok(self
            .group_entry_by_dn(&config, dn)?
            .map(|e| e.group().clone()))
    }

    /// Group with the given common name. More than one match is logged and
    /// the first is used.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the directory cannot be queried.
    pub fn find_group_by_name(&self, cn: &str) -> Result<Option<Group>> {
        let config = self.config.get();
        Ok(self
            .group_entry_by_name(&config, cn)?
            .map(|e| e.group().clone()))
    }

    /// User with the given DN.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the directory cannot be queried.
    pub fn find_user_by_dn(&self, dn: &str) -> Result<Option<User>> {
        let config = self.config.get();
        let Some(attributes) = self.directory.get_attributes(dn)? else {
            return Ok(None);
        };
        let entry = DirectoryEntry {
            dn: dn.to_string(),
            attributes,
        };
        Ok(user_from_entry(&config, &entry))
    }

    /// User whose login attribute equals `login`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the directory cannot be queried.
    pub fn find_user_by_login(&self, login: &str) -> Result<Option<User>> {
        let config = self.config.get();
        self.first_user(&config, user_login_filter(&config, login), login)
    }

    /// User named by an `attr=value` member string.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the directory cannot be queried.
    pub fn nv_search_for_user(&self, nv_pair: &str) -> Result<Option<User>> {
        let config = self.config.get();
        let Some((attr, value)) = split_nv_pair(nv_pair) else {
            debug!(member = %nv_pair, "Member value is not an attr=value pair");
            return Ok(None);
        };
        let filter = Filter::and(vec![
            object_class_filter(config.user_mappings.iter().map(|m| m.object_class.as_str())),
            Filter::eq(attr, value),
        ]);
        self.first_user(&config, filter, nv_pair)
    }

    fn first_user(&self, config: &ProviderConfig, filter: Filter, what: &str) -> Result<Option<User>> {
        if filter.is_empty_or() {
            return Ok(None);
        }
        let request = SearchRequest::new(config.search_base.clone(), filter).limit(2);
        let results = self.directory.search(&request)?;
        if results.entries.len() > 1 || results.truncated {
            warn!(user = %what, "More than one user matched, using the first");
        }
        Ok(results
            .entries
            .iter()
            .find_map(|e| user_from_entry(config, e)))
    }

    fn group_entry_by_dn(&self, config: &ProviderConfig, dn: &str) -> Result<Option<Arc<GroupCacheEntry>>> {
        let tunables = &config.tunables;
        if let Some(entry) = self.cache.get_by_dn(dn, tunables.group_cache_max_age) {
            return Ok(Some(entry));
        }
        let Some(attributes) = self.directory.get_attributes(dn)? else {
            return Ok(None);
        };
        let entry = DirectoryEntry {
            dn: dn.to_string(),
            attributes,
        };
        Ok(group_from_entry(config, &entry).map(|g| self.remember(config, g)))
    }

    fn group_entry_by_name(&self, config: &ProviderConfig, cn: &str) -> Result<Option<Arc<GroupCacheEntry>>> {
        if let Some(entry) = self.cache.get_by_cn(cn, config.tunables.group_cache_max_age) {
            return Ok(Some(entry));
        }
        let filter = Filter::or(
            config
                .group_mappings
                .iter()
                .map(|m| {
                    Filter::and(vec![
                        Filter::eq("objectClass", &m.object_class),
                        Filter::eq(&m.name_attr, cn),
                    ])
                })
                .collect(),
        );
        self.first_group(config, filter, cn)
    }

    fn first_group(&self, config: &ProviderConfig, filter: Filter, what: &str) -> Result<Option<Arc<GroupCacheEntry>>> {
        if filter.is_empty_or() {
            return Ok(None);
        }
        let request = SearchRequest::new(config.search_base.clone(), filter).limit(2);
        let results = self.directory.search(&request)?;
        if results.entries.len() > 1 || results.truncated {
            warn!(group = %what, "More than one group matched, using the first");
        }
        Ok(results
            .entries
            .iter()
            .find_map(|e| group_from_entry(config, e))
            .map(|g| self.remember(config, g)))
    }

    fn remember(&self, config: &ProviderConfig, group: Group) -> Arc<GroupCacheEntry> {
        self.cache.insert(
            group,
            config.tunables.group_cache_size,
            config.tunables.group_cache_max_age,
        )
    }

    fn entry_for(&self, config: &ProviderConfig, group: &Group) -> Arc<GroupCacheEntry> {
        self.cache
            .get_by_dn(&group.dn, config.tunables.group_cache_max_age)
            .unwrap_or_else(|| self.remember(config, group.clone()))
    }

    /// Resolve a raw member value to a group according to `strategy`.
    fn member_as_group(
        &self,
        config: &ProviderConfig,
        strategy: MemberStrategy,
        member: &str,
    ) -> Result<Option<Arc<GroupCacheEntry>>> {
        match strategy {
            MemberStrategy::MembersByOu => Ok(None),
            MemberStrategy::MembersAreDn => self.group_entry_by_dn(config, member),
            MemberStrategy::MembersAreLogin => self.group_entry_by_name(config, member),
            MemberStrategy::MembersAreNvPair => {
                if looks_like_dn(member) {
                    if let Some(entry) = self.group_entry_by_dn(config, member)? {
                        return Ok(Some(entry));
                    }
                }
                let Some((attr, value)) = split_nv_pair(member) else {
                    return Ok(None);
                };
                let filter = Filter::and(vec![
                    object_class_filter(config.group_mappings.iter().map(|m| m.object_class.as_str())),
                    Filter::eq(attr, value),
                ]);
                self.first_group(config, filter, member)
            }
        }
    }

    /// Resolve a raw member value to a user according to `strategy`.
    fn member_as_user(&self, config: &ProviderConfig, strategy: MemberStrategy, member: &str) -> Result<Option<User>> {
        match strategy {
            MemberStrategy::MembersByOu => Ok(None),
            MemberStrategy::MembersAreDn => self.find_user_by_dn(member),
            MemberStrategy::MembersAreLogin => self.first_user(config, user_login_filter(config, member), member),
            MemberStrategy::MembersAreNvPair => {
                if looks_like_dn(member) {
                    if let Some(user) = self.find_user_by_dn(member)? {
                        return Ok(Some(user));
                    }
                }
                self.nv_search_for_user(member)
            }
        }
    }

    // ========================================================================
    // User in group
    // ========================================================================

    /// Whether `user` belongs to `group`, directly or through nested groups.
    ///
    /// A user or group from another provider is never a member.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the directory cannot be queried.
    pub fn is_member(&self, user: &User, group: &Group) -> Result<bool> {
        let config = self.config.get();
        if user.provider_id != config.id || group.provider_id != config.id {
            debug!(user = %user.dn, group = %group.dn, "Identity belongs to another provider");
            return Ok(false);
        }
        let entry = self.entry_for(&config, group);
        let mut visited = HashSet::from([dn::canonicalize(&group.dn)]);
        self.is_member_at(&config, user, &entry, 1, &mut visited)
    }

    fn is_member_at(
        &self,
        config: &ProviderConfig,
        user: &User,
        entry: &GroupCacheEntry,
        depth: u32,
        visited: &mut HashSet<String>,
    ) -> Result<bool> {
        let group = entry.group();
        let Some(mapping) = config.group_mapping_for(&group.attributes.object_classes()) else {
            return Ok(false);
        };
        let strategy = mapping.member_strategy;
        let tunables = &config.tunables;
        let may_nest = tunables.group_nesting_enabled() && tunables.process_next_depth(depth);
        if strategy == MemberStrategy::MembersByOu {
            if dn::is_descendant(&user.dn, &group.dn) && !dn::same_dn(&user.dn, &group.dn) {
                return Ok(true);
            }
            if !may_nest {
                return Ok(false);
            }
            for header in self.ou_contents(config, entry)?.groups {
                if !visited.insert(header.canonical_dn().to_string()) {
                    continue;
                }
                if let Some(sub) = self.group_entry_by_dn(config, &header.dn)? {
                    if self.is_member_at(config, user, &sub, depth + 1, visited)? {
                        return Ok(true);
                    }
                }
            }
            return Ok(false);
        }

        let members = group.attributes.strings(&mapping.member_attr);
        let candidates = user_member_values(config, user, strategy);
        let ignore_case = config.group_membership_case_insensitive;
        let by_dn = strategy == MemberStrategy::MembersAreNvPair;
        if members.iter().any(|m| {
            candidates.iter().any(|c| member_matches(strategy, m, c, ignore_case))
                || (by_dn && dn::same_dn(m, &user.dn))
        }) {
            return Ok(true);
        }

        if !may_nest {
            return Ok(false);
        }
        for member in &members {
            if entry.is_known_non_group(member) {
                continue;
            }
            match self.member_as_group(config, strategy, member)? {
                Some(sub) => {
                    if visited.insert(dn::canonicalize(&sub.group().dn))
                        && self.is_member_at(config, user, &sub, depth + 1, visited)?
                    {
                        return Ok(true);
                    }
                }
                None => entry.record_non_group(member),
            }
        }
        Ok(false)
    }

    // ========================================================================
    // Groups of a user
    // ========================================================================

    /// Every group `user` belongs to.
    ///
    /// Direct memberships come from one combined directory search across all
    /// attribute-based strategies. OU groups are found among the user's own
    /// DN suffixes. When nesting is enabled, groups containing those groups
    /// are added up to the nesting depth.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the membership search fails. Failures
    /// while following nested groups are logged and leave the result
    /// incomplete.
    pub fn get_group_headers(&self, user: &User) -> Result<HeaderSet> {
        let config = self.config.get();
        let mut headers = HeaderSet::new();
        if user.provider_id != config.id {
            return Ok(headers);
        }

        let filter = membership_filter(&config, |strategy| user_member_values(&config, user, strategy));
        let mut direct = Vec::new();
        if !filter.is_empty_or() {
            let request = SearchRequest::new(config.search_base.clone(), filter)
                .limit(config.tunables.max_group_search_results);
            let results = self.directory.search(&request)?;
            if results.truncated {
                warn!(user = %user.dn, "Group membership search truncated");
                headers.mark_truncated();
            }
            for entry in &results.entries {
                if let Some(group) = group_from_entry(&config, entry) {
                    let header = group.header();
                    self.entry_for(&config, &group);
                    if headers.insert(header.clone()) {
                        direct.push(header);
                    }
                }
            }
        }

        if config.has_ou_strategy() {
            for header in self.ou_groups(&config, &user.dn) {
                if headers.insert(header.clone()) {
                    direct.push(header);
                }
            }
        }

        let tunables = &config.tunables;
        if tunables.group_nesting_enabled() && tunables.process_next_depth(1) {
            for header in &direct {
                self.collect_sub_groups(&config, header, 2, &mut headers);
            }
        }
        Ok(headers)
    }

    /// Add the OU groups among the suffixes of `user_dn`.
    ///
    /// Only suffixes whose entry is a group using the OU strategy count.
    /// Lookup failures are logged and the candidate skipped.
    pub fn add_ou_groups(&self, user_dn: &str, headers: &mut HeaderSet) {
        let config = self.config.get();
        for header in self.ou_groups(&config, user_dn) {
            headers.insert(header);
        }
    }

    fn ou_groups(&self, config: &ProviderConfig, user_dn: &str) -> Vec<IdentityHeader> {
        dn::ou_suffixes(user_dn)
            .into_iter()
            .filter_map(|candidate| match self.ou_group(config, &candidate) {
                Ok(found) => found,
                Err(e) => {
                    warn!(dn = %candidate, error = %e, "Could not resolve OU group candidate");
                    None
                }
            })
            .collect()
    }

    fn ou_group(&self, config: &ProviderConfig, dn: &str) -> Result<Option<IdentityHeader>> {
        Ok(self
            .group_entry_by_dn(config, dn)?
            .filter(|entry| is_ou_group(config, entry.group()))
            .map(|entry| entry.group().header()))
    }

    /// Attribute-based groups located under the OU group of `entry`.
    /// Searched once per cache entry.
    fn ou_contents(&self, config: &ProviderConfig, entry: &GroupCacheEntry) -> Result<GroupList> {
        if let Some(cached) = entry.cached_ou_contents() {
            return Ok(cached);
        }
        let ou = entry.group();
        let filter = object_class_filter(
            config
                .group_mappings
                .iter()
                .filter(|m| m.member_strategy != MemberStrategy::MembersByOu)
                .map(|m| m.object_class.as_str()),
        );
        let mut contents = GroupList::default();
        if !filter.is_empty_or() {
            let request = SearchRequest::new(ou.dn.clone(), filter)
                .limit(config.tunables.max_group_search_results);
            let results = self.directory.search(&request)?;
            if results.truncated {
                warn!(ou = %ou.dn, "OU group search truncated");
                contents.truncated = true;
            }
            for e in &results.entries {
                if dn::same_dn(&e.dn, &ou.dn) {
                    continue;
                }
                if let Some(group) = group_from_entry(config, e).filter(|g| !is_ou_group(config, g)) {
                    contents.groups.push(group.header());
                    self.entry_for(config, &group);
                }
            }
        }
        entry.set_ou_contents(contents.clone());
        Ok(contents)
    }

    /// Groups that contain `group`, followed transitively from `depth`.
    ///
    /// `depth` is the nesting depth the containing groups sit at; `group`
    /// itself is one level above. Failures are logged and the walk stops
    /// at the failing group.
    pub fn get_sub_groups(&self, group: &IdentityHeader, depth: u32) -> HeaderSet {
        let config = self.config.get();
        let mut headers = HeaderSet::new();
        let tunables = &config.tunables;
        if tunables.group_nesting_enabled() && tunables.process_next_depth(depth.saturating_sub(1)) {
            self.collect_sub_groups(&config, group, depth, &mut headers);
        }
        headers
    }

    /// Every group that contains the group at `dn`, directly or through
    /// nesting. Empty when nesting is disabled or `dn` is not a group.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the group itself cannot be fetched.
    pub fn get_group_headers_for_nested_group(&self, dn: &str) -> Result<HeaderSet> {
        let config = self.config.get();
        if !config.tunables.group_nesting_enabled() {
            return Ok(HeaderSet::new());
        }
        let Some(entry) = self.group_entry_by_dn(&config, dn)? else {
            return Ok(HeaderSet::new());
        };
        Ok(self.get_sub_groups(&entry.group().header(), 2))
    }

    fn collect_sub_groups(&self, config: &ProviderConfig, group: &IdentityHeader, depth: u32, headers: &mut HeaderSet) {
        let containing = match self.sub_groups_once(config, group, headers) {
            Ok(list) => list,
            Err(e) => {
                warn!(group = %group.dn, depth, error = %e, "Could not resolve nested groups");
                return;
            }
        };
        for header in containing {
            if headers.insert(header.clone()) && config.tunables.process_next_depth(depth) {
                self.collect_sub_groups(config, &header, depth + 1, headers);
            }
        }
    }

    /// Groups listing `group` as a member, plus the OU groups above it, one
    /// step only. A truncated list stays marked truncated when served from
    /// the cache.
    fn sub_groups_once(
        &self,
        config: &ProviderConfig,
        group: &IdentityHeader,
        headers: &mut HeaderSet,
    ) -> Result<Vec<IdentityHeader>> {
        let entry = self
            .cache
            .get_by_dn(&group.dn, config.tunables.group_cache_max_age);
        if let Some(cached) = entry.as_ref().and_then(|e| e.cached_subgroups()) {
            if cached.truncated {
                headers.mark_truncated();
            }
            return Ok(cached.groups);
        }

        let filter = membership_filter(config, |strategy| group_member_values(config, group, strategy));
        let mut found = GroupList::default();
        if !filter.is_empty_or() {
            let request = SearchRequest::new(config.search_base.clone(), filter)
                .limit(config.tunables.max_group_search_results);
            let results = self.directory.search(&request)?;
            if results.truncated {
                warn!(group = %group.dn, "Nested group search truncated");
                found.truncated = true;
            }
            for e in &results.entries {
                if let Some(parent) = group_from_entry(config, e) {
                    if !dn::same_dn(&parent.dn, &group.dn) {
                        found.groups.push(parent.header());
                        self.entry_for(config, &parent);
                    }
                }
            }
        }
        if config.has_ou_strategy() {
            for candidate in dn::ou_suffixes(&group.dn) {
                if let Some(ou) = self.ou_group(config, &candidate)? {
                    if !found.groups.contains(&ou) {
                        found.groups.push(ou);
                    }
                }
            }
        }

        if found.truncated {
            headers.mark_truncated();
        }
        if let Some(entry) = entry {
            entry.set_subgroups(found.clone());
        }
        Ok(found.groups)
    }

    // ========================================================================
    // Users of a group
    // ========================================================================

    /// Every user in `group`, including members of nested groups.
    ///
    /// Member values that resolve to neither a user nor a group are
    /// remembered on the group's cache entry and skipped next time.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the directory cannot be queried.
    pub fn get_user_headers(&self, group: &Group) -> Result<HeaderSet> {
        let config = self.config.get();
        let mut headers = HeaderSet::new();
        if group.provider_id != config.id {
            return Ok(headers);
        }
        let entry = self.entry_for(&config, group);
        let mut visited = HashSet::from([dn::canonicalize(&group.dn)]);
        self.collect_members(&config, &entry, 1, &mut visited, &mut headers)?;
        Ok(headers)
    }

    fn collect_members(
        &self,
        config: &ProviderConfig,
        entry: &GroupCacheEntry,
        depth: u32,
        visited: &mut HashSet<String>,
        headers: &mut HeaderSet,
    ) -> Result<()> {
        let group = entry.group();
        let Some(mapping) = config.group_mapping_for(&group.attributes.object_classes()) else {
            return Ok(());
        };
        let strategy = mapping.member_strategy;

        if strategy == MemberStrategy::MembersByOu {
            let filter = object_class_filter(config.user_mappings.iter().map(|m| m.object_class.as_str()));
            let request = SearchRequest::new(group.dn.clone(), filter)
                .limit(config.tunables.max_group_search_results);
            let results = self.directory.search(&request)?;
            if results.truncated {
                headers.mark_truncated();
            }
            for e in &results.entries {
                if let Some(user) = user_from_entry(config, e) {
                    headers.insert(user.header());
                }
            }
            return Ok(());
        }

        let tunables = &config.tunables;
        let may_nest = tunables.group_nesting_enabled() && tunables.process_next_depth(depth);
        for member in group.attributes.strings(&mapping.member_attr) {
            if entry.is_unresolved(&member) {
                continue;
            }
            if let Some(user) = self.member_as_user(config, strategy, &member)? {
                headers.insert(user.header());
                continue;
            }
            if !may_nest {
                continue;
            }
            // users are recorded as non-groups too, so this check comes second
            if entry.is_known_non_group(&member) {
                entry.record_unresolved(&member);
                continue;
            }
            match self.member_as_group(config, strategy, &member)? {
                Some(sub) => {
                    if visited.insert(dn::canonicalize(&sub.group().dn)) {
                        self.collect_members(config, &sub, depth + 1, visited, headers)?;
                    }
                }
                None => {
                    entry.record_non_group(&member);
                    entry.record_unresolved(&member);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Users and/or groups whose login or name matches `pattern` (`*`
    /// wildcards allowed). Users whose account is not usable are left out.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Lookup`] when the directory cannot be queried.
    pub fn search(&self, kinds: &[EntityKind], pattern: &str) -> Result<HeaderSet> {
        let config = self.config.get();
        let mut headers = HeaderSet::new();
        let limit = config.tunables.max_search_results;

        if kinds.contains(&EntityKind::User) {
            let filter = user_search_filter(&config, pattern);
            if !filter.is_empty_or() {
                let results = self
                    .directory
                    .search(&SearchRequest::new(config.search_base.clone(), filter).limit(limit))?;
                if results.truncated {
                    headers.mark_truncated();
                }
                let now = self.clock.now_ms();
                for e in &results.entries {
                    let Some(user) = user_from_entry(&config, e) else {
                        continue;
                    };
                    let status = account_status(&user.attributes, now);
                    if status.is_valid() {
                        headers.insert(user.header());
                    } else {
                        debug!(user = %user.dn, ?status, "Skipping unusable account");
                    }
                }
            }
        }

        if kinds.contains(&EntityKind::Group) {
            let filter = group_search_filter(&config, pattern);
            if !filter.is_empty_or() {
                let results = self
                    .directory
                    .search(&SearchRequest::new(config.search_base.clone(), filter).limit(limit))?;
                if results.truncated {
                    headers.mark_truncated();
                }
                for e in &results.entries {
                    if let Some(group) = group_from_entry(&config, e) {
                        headers.insert(group.header());
                    }
                }
            }
        }
        Ok(headers)
    }
}

// ============================================================================
// Member values and filters
// ============================================================================

fn split_nv_pair(value: &str) -> Option<(&str, &str)> {
    let (attr, value) = value.split_once('=')?;
    let attr = attr.trim();
    if attr.is_empty() {
        return None;
    }
    Some((attr, value.trim()))
}

/// More than one RDN, so a DN rather than a single `attr=value` pair.
fn looks_like_dn(value: &str) -> bool {
    dn::split_rdns(value).len() > 1
}

fn is_ou_group(config: &ProviderConfig, group: &Group) -> bool {
    config
        .group_mapping_for(&group.attributes.object_classes())
        .is_some_and(|m| m.member_strategy == MemberStrategy::MembersByOu)
}

fn object_class_filter<'a>(classes: impl Iterator<Item = &'a str>) -> Filter {
    Filter::or(classes.map(|oc| Filter::eq("objectClass", oc)).collect())
}

/// Member attribute values that would name `user` under `strategy`.
fn user_member_values(config: &ProviderConfig, user: &User, strategy: MemberStrategy) -> Vec<String> {
    match strategy {
        MemberStrategy::MembersByOu => Vec::new(),
        MemberStrategy::MembersAreDn => vec![user.dn.clone()],
        MemberStrategy::MembersAreLogin => vec![user.login.clone()],
        MemberStrategy::MembersAreNvPair => config
            .nv_pair_name_attributes()
            .iter()
            .flat_map(|attr| {
                user.attributes
                    .strings(attr)
                    .into_iter()
                    .map(move |v| format!("{attr}={v}"))
            })
            .chain(std::iter::once(user.dn.clone()))
            .collect(),
    }
}

/// Member attribute values that would name `group` under `strategy`.
fn group_member_values(config: &ProviderConfig, group: &IdentityHeader, strategy: MemberStrategy) -> Vec<String> {
    match strategy {
        MemberStrategy::MembersByOu => Vec::new(),
        MemberStrategy::MembersAreDn => vec![group.dn.clone()],
        MemberStrategy::MembersAreLogin => vec![group.name.clone()],
        MemberStrategy::MembersAreNvPair => {
            let mut attrs: Vec<&str> = Vec::new();
            for m in &config.group_mappings {
                if !attrs.iter().any(|a| a.eq_ignore_ascii_case(&m.name_attr)) {
                    attrs.push(&m.name_attr);
                }
            }
            attrs
                .into_iter()
                .map(|attr| format!("{attr}={}", group.name))
                .chain(std::iter::once(group.dn.clone()))
                .collect()
        }
    }
}

/// `(|(&(objectClass=G)(|(member=v1)(member=v2)))...)` over every
/// attribute-based group mapping.
fn membership_filter(config: &ProviderConfig, values: impl Fn(MemberStrategy) -> Vec<String>) -> Filter {
    Filter::or(
        config
            .group_mappings
            .iter()
            .filter(|m| m.member_strategy != MemberStrategy::MembersByOu)
            .filter_map(|m| {
                let values = values(m.member_strategy);
                if values.is_empty() {
                    return None;
                }
                Some(Filter::and(vec![
                    Filter::eq("objectClass", &m.object_class),
                    Filter::or(
                        values
                            .into_iter()
                            .map(|v| Filter::eq(&m.member_attr, v))
                            .collect(),
                    ),
                ]))
            })
            .collect(),
    )
}

fn member_matches(strategy: MemberStrategy, member: &str, candidate: &str, ignore_case: bool) -> bool {
    let eq = |a: &str, b: &str| {
        if ignore_case {
            a.to_lowercase() == b.to_lowercase()
        } else {
            a == b
        }
    };
    match strategy {
        MemberStrategy::MembersByOu => false,
        MemberStrategy::MembersAreDn => dn::same_dn(member, candidate),
        MemberStrategy::MembersAreLogin => eq(member.trim(), candidate),
        MemberStrategy::MembersAreNvPair => match (split_nv_pair(member), split_nv_pair(candidate)) {
            (Some((ma, mv)), Some((ca, cv))) => ma.eq_ignore_ascii_case(ca) && eq(mv, cv),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv_pairs_split_on_first_equals() {
        assert_eq!(split_nv_pair("cn = Bob=1"), Some(("cn", "Bob=1")));
        assert_eq!(split_nv_pair("=bob"), None);
        assert_eq!(split_nv_pair("bob"), None);
    }

    #[test]
    fn member_comparison_per_strategy() {
        use MemberStrategy::*;
        assert!(member_matches(MembersAreDn, "CN=Bob, DC=x", "cn=bob,dc=x", false));
        assert!(!member_matches(MembersAreLogin, "Bob", "bob", false));
        assert!(member_matches(MembersAreLogin, "Bob", "bob", true));
        assert!(member_matches(MembersAreNvPair, "CN=bob", "cn=bob", false));
        assert!(!member_matches(MembersAreNvPair, "cn=Bob", "cn=bob", false));
        assert!(member_matches(MembersAreNvPair, "cn=Bob", "cn=bob", true));
        assert!(!member_matches(MembersByOu, "x", "x", true));
    }

    #[test]
    fn single_rdn_values_are_not_dns() {
        assert!(looks_like_dn("cn=bob,dc=x"));
        assert!(!looks_like_dn("cn=Bob"));
        assert!(!looks_like_dn(r"cn=Smith\, J"));
    }

    #[test]
    fn membership_filter_skips_ou_mappings() {
        use crate::config::GroupMapping;
        let config = ProviderConfig {
            group_mappings: vec![
                GroupMapping {
                    object_class: "groupOfNames".to_string(),
                    name_attr: "cn".to_string(),
                    member_attr: "member".to_string(),
                    member_strategy: MemberStrategy::MembersAreDn,
                },
                GroupMapping {
                    object_class: "organizationalUnit".to_string(),
                    name_attr: "ou".to_string(),
                    member_attr: String::new(),
                    member_strategy: MemberStrategy::MembersByOu,
                },
                GroupMapping {
                    object_class: "posixGroup".to_string(),
                    name_attr: "cn".to_string(),
                    member_attr: "memberUid".to_string(),
                    member_strategy: MemberStrategy::MembersAreLogin,
                },
            ],
            ..ProviderConfig::default()
        };
        let filter = membership_filter(&config, |s| match s {
            MemberStrategy::MembersAreDn => vec!["cn=bob,dc=x".to_string()],
            MemberStrategy::MembersAreLogin => vec!["bob".to_string()],
            _ => Vec::new(),
        });
        assert_eq!(
            filter.to_string(),
            "(|(&(objectClass=groupOfNames)(member=cn=bob,dc=x))(&(objectClass=posixGroup)(memberUid=bob)))"
        );
    }
}
