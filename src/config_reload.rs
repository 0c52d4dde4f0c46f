//! Provider config hot-reload.
//!
//! [`LiveConfig`] is the single place every component reads its settings
//! from, so tunables (intervals, cache lifetimes, nesting depth, result
//! ceilings) and schema mappings take effect on the next call after a
//! reload. [`ConfigWatcher`] watches the YAML file and applies changes.
//!
//! # Limitations
//!
//! The endpoint list is owned by the failover tracker and is not swapped at
//! runtime; a change to `urls` is logged and needs a restart. A change of
//! provider identity (`id` or `name`) retires the running provider: its
//! maintenance tasks observe the retirement through [`ProviderLiveness`] and
//! stop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::ProviderConfig;
use crate::directory::ProviderLiveness;

// ============================================================================
// Public types
// ============================================================================

/// What changed between two [`ProviderConfig`] snapshots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigPatch {
    /// `id` or `name` changed: this is a different provider now
    pub identity_changed: bool,
    /// `urls` changed (requires restart)
    pub endpoints_changed: bool,
    /// Bind identity or TLS settings changed
    pub connection_changed: bool,
    /// User/group mappings, certificate settings or membership options changed
    pub schema_changed: bool,
    /// Tunables changed
    pub tunables_changed: bool,
}

impl ConfigPatch {
    /// Returns `true` when no changes were detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Human-readable summary of the patch.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.identity_changed {
            parts.push("provider identity changed (provider retired)");
        }
        if self.endpoints_changed {
            parts.push("directory urls changed (restart required)");
        }
        if self.connection_changed {
            parts.push("bind/tls settings changed");
        }
        if self.schema_changed {
            parts.push("schema mappings changed");
        }
        if self.tunables_changed {
            parts.push("tunables changed");
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Live, swappable provider config.
///
/// Readers clone the inner `Arc` under a read lock; writers swap the whole
/// `Arc`, so a reader holds one consistent snapshot for the duration of a call.
#[derive(Debug)]
pub struct LiveConfig {
    inner: RwLock<Arc<ProviderConfig>>,
    retired: AtomicBool,
}

impl LiveConfig {
    /// Create a `LiveConfig` seeded with the startup configuration.
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
            retired: AtomicBool::new(false),
        }
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<ProviderConfig> {
        Arc::clone(&self.inner.read())
    }

    /// Replace the current config.
    pub fn set(&self, config: ProviderConfig) {
        *self.inner.write() = Arc::new(config);
    }

    /// Mark the provider as removed; its background tasks stop.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Whether [`LiveConfig::retire`] was called.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

impl ProviderLiveness for LiveConfig {
    fn is_current_configuration_stale(&self) -> Result<bool> {
        Ok(self.is_retired())
    }
}

// ============================================================================
// Diff computation
// ============================================================================

/// Compute what changed between two config snapshots.
#[must_use]
pub fn compute_diff(old: &ProviderConfig, new: &ProviderConfig) -> ConfigPatch {
    ConfigPatch {
        identity_changed: old.id != new.id || old.name != new.name,
        endpoints_changed: old.urls != new.urls,
        connection_changed: old.bind_dn != new.bind_dn
            || old.bind_password != new.bind_password
            || old.tls != new.tls
            || old.search_base != new.search_base,
        schema_changed: old.user_mappings != new.user_mappings
            || old.group_mappings != new.group_mappings
            || old.certificates != new.certificates
            || old.group_membership_case_insensitive != new.group_membership_case_insensitive
            || old.member_nv_pair_attribute != new.member_nv_pair_attribute,
        tunables_changed: old.tunables != new.tunables,
    }
}

/// Apply `new` to `live` according to `patch`.
pub fn apply_patch(live: &LiveConfig, patch: &ConfigPatch, new: ProviderConfig) {
    if patch.identity_changed {
        warn!(
            old = %live.get().name,
            new = %new.name,
            "Provider identity changed, retiring running provider"
        );
        live.retire();
        return;
    }
    if patch.endpoints_changed {
        warn!("Directory url changes are not applied until restart");
    }
    live.set(new);
}

// ============================================================================
// File watcher
// ============================================================================

/// Watches the provider YAML and applies changes to a [`LiveConfig`].
///
/// Holds the underlying `notify` watcher alive for the lifetime of the struct.
pub struct ConfigWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        config_path: PathBuf,
        live_config: Arc<LiveConfig>,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);
        let watcher = Self::create_notify_watcher(event_tx, &config_path)?;
        Self::spawn_reload_task(config_path, live_config, event_rx, shutdown_rx);
        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    fn create_notify_watcher(
        event_tx: tokio::sync::mpsc::Sender<()>,
        config_path: &Path,
    ) -> Result<RecommendedWatcher> {
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let path_for_closure = config_path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                if result.as_ref().is_ok_and(|e| is_config_event(e, &path_for_closure)) {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| crate::Error::Internal(format!("Failed to create config watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| crate::Error::Internal(format!("Failed to watch config path: {e}")))?;

        Ok(watcher)
    }

    fn spawn_reload_task(
        config_path: PathBuf,
        live_config: Arc<LiveConfig>,
        mut event_rx: tokio::sync::mpsc::Receiver<()>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            let mut last_event: Option<Instant> = None;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                    }
                    _ = ticker.tick() => {
                        if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            last_event = None;
                            reload_once(&config_path, &live_config);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
                if live_config.is_retired() {
                    info!("Provider retired, config watcher stopping");
                    break;
                }
            }
        });
    }
}

fn is_config_event(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p.ends_with(config_path) || p == config_path)
}

/// Re-read `config_path` and apply it. Returns the applied patch, or `None`
/// when the file failed to load (the running config is kept).
pub fn reload_once(config_path: &Path, live_config: &LiveConfig) -> Option<ConfigPatch> {
    let new_config = match ProviderConfig::load(Some(config_path)) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Config reload: failed to load config file, keeping current config");
            return None;
        }
    };

    let patch = compute_diff(&live_config.get(), &new_config);
    if patch.is_empty() {
        debug!("Config reload: no changes detected");
        return Some(patch);
    }

    info!(changes = %patch.summary(), "Config reload: applying patch");
    apply_patch(live_config, &patch, new_config);
    Some(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemberStrategy, GroupMapping};

    fn base() -> ProviderConfig {
        ProviderConfig {
            name: "corp".to_string(),
            id: 7,
            urls: vec!["ldap://a".to_string()],
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn identical_configs_give_empty_patch() {
        let patch = compute_diff(&base(), &base());
        assert!(patch.is_empty());
        assert_eq!(patch.summary(), "no changes");
    }

    #[test]
    fn tunable_change_is_applied() {
        let live = LiveConfig::new(base());
        let mut new = base();
        new.tunables.group_max_nesting = 3;
        let patch = compute_diff(&live.get(), &new);
        assert!(patch.tunables_changed);
        assert!(!patch.schema_changed);

        apply_patch(&live, &patch, new);
        assert_eq!(live.get().tunables.group_max_nesting, 3);
        assert!(!live.is_retired());
    }

    #[test]
    fn schema_change_is_detected() {
        let mut new = base();
        new.group_mappings.push(GroupMapping {
            object_class: "groupOfNames".to_string(),
            name_attr: "cn".to_string(),
            member_attr: "member".to_string(),
            member_strategy: MemberStrategy::MembersAreDn,
        });
        let patch = compute_diff(&base(), &new);
        assert!(patch.schema_changed);
        assert_eq!(patch.summary(), "schema mappings changed");
    }

    #[test]
    fn identity_change_retires_provider() {
        let live = LiveConfig::new(base());
        let mut new = base();
        new.id = 8;
        let patch = compute_diff(&live.get(), &new);
        apply_patch(&live, &patch, new);
        assert!(live.is_retired());
        assert!(live.is_current_configuration_stale().unwrap());
        assert_eq!(live.get().id, 7);
    }

    #[test]
    fn reload_once_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.yaml");
        std::fs::write(
            &path,
            "name: corp\nid: 7\nurls: [\"ldap://a\"]\nsearch_base: dc=x\n\
             user_mappings:\n  - object_class: person\n    login_attr: uid\n\
             tunables:\n  max_search_results: 5\n",
        )
        .unwrap();

        let live = LiveConfig::new(base());
        let patch = reload_once(&path, &live).unwrap();
        assert!(patch.tunables_changed);
        assert!(patch.schema_changed);
        assert_eq!(live.get().tunables.max_search_results, 5);

        std::fs::write(&path, "urls: [not yaml").unwrap();
        assert!(reload_once(&path, &live).is_none());
        assert_eq!(live.get().tunables.max_search_results, 5);
    }
}
