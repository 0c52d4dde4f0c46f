//! Background upkeep of the certificate index and cache.
//!
//! Two periodic tasks per provider:
//!
//! - **index rebuild**: scan the directory for entries carrying
//!   certificates, index every decodable certificate into a fresh snapshot,
//!   and publish it. Skipped unless the provider is in `index` mode.
//! - **cache sweep**: drop cached certificates older than their lifetime.
//!
//! Both tick bodies are synchronous and usable without a runtime.
//! [`IndexMaintenance::spawn`] drives them on tokio, re-reading the
//! intervals after every run so reloaded tunables reschedule the loop. Each
//! tick first asks the [`ProviderLiveness`] check whether the provider still
//! exists and cancels the task for good once it does not.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cert::store::cert_attributes;
use crate::cert::{CertIndexSnapshot, CertificateCache, CertificateIndex, DecodedCertificate};
use crate::config::{CertificateMode, Tunables};
use crate::config_reload::LiveConfig;
use crate::directory::filter::cert_presence_filter;
use crate::directory::{Directory, ProviderLiveness, SearchRequest};
use crate::{Error, Result};

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The work ran
    Completed,
    /// Nothing to do in the current configuration
    Skipped,
    /// The work failed; the task keeps its schedule
    Failed,
    /// The provider is stale; the task must not run again
    Cancelled,
}

/// Certificate index rebuild and cache sweep for one provider.
pub struct IndexMaintenance {
    config: Arc<LiveConfig>,
    directory: Arc<dyn Directory>,
    index: Arc<CertificateIndex>,
    cache: Arc<CertificateCache>,
    liveness: Arc<dyn ProviderLiveness>,
    cancelled: AtomicBool,
}

impl IndexMaintenance {
    /// Maintenance over the given index and cache.
    #[must_use]
    pub fn new(
        config: Arc<LiveConfig>,
        directory: Arc<dyn Directory>,
        index: Arc<CertificateIndex>,
        cache: Arc<CertificateCache>,
        liveness: Arc<dyn ProviderLiveness>,
    ) -> Self {
        Self {
            config,
            directory,
            index,
            cache,
            liveness,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Whether a liveness check has cancelled the tasks.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn still_current(&self, task: &str) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.liveness.is_current_configuration_stale() {
            Ok(false) => true,
            Ok(true) => {
                info!(task, provider = %self.config.get().name, "Provider configuration removed, cancelling maintenance");
                self.cancelled.store(true, Ordering::SeqCst);
                false
            }
            Err(e) => {
                warn!(task, error = %e, "Could not check provider liveness, assuming current");
                true
            }
        }
    }

    /// Index rebuild tick.
    pub fn run_index_rebuild(&self) -> TaskStatus {
        if !self.still_current("index_rebuild") {
            return TaskStatus::Cancelled;
        }
        if self.config.get().certificates.mode != CertificateMode::Index {
            debug!("Certificate indexing disabled, skipping rebuild");
            return TaskStatus::Skipped;
        }
        match self.rebuild_index() {
            Ok(_) => TaskStatus::Completed,
            Err(e) => {
                warn!(error = %e, "Certificate index rebuild failed, keeping previous index");
                TaskStatus::Failed
            }
        }
    }

    /// Cache sweep tick.
    pub fn run_cache_sweep(&self) -> TaskStatus {
        if !self.still_current("cache_sweep") {
            return TaskStatus::Cancelled;
        }
        let lifetime = self.config.get().tunables.effective_cert_entry_lifetime();
        let removed = self.cache.sweep(lifetime);
        if removed > 0 {
            debug!(removed, "Expired cached certificates");
        }
        TaskStatus::Completed
    }

    /// Scan the directory and publish a new index. Returns the number of
    /// certificates indexed.
    ///
    /// Undecodable certificate values are skipped. A failed scan publishes
    /// nothing.
    pub fn rebuild_index(&self) -> Result<usize> {
        let config = self.config.get();
        let filter = cert_presence_filter(&config)?;
        if filter.is_empty_or() {
            return Err(Error::Config(
                "no user mapping declares a certificate attribute".to_string(),
            ));
        }
        let attrs = cert_attributes(&config);
        let request = SearchRequest::new(config.search_base.clone(), filter).attributes(attrs.clone());
        let results = self.directory.search(&request)?;
        if results.truncated {
            warn!("Certificate scan was truncated by the server, index is partial");
        }

        let mut snapshot = CertIndexSnapshot::new();
        let mut indexed = 0;
        for entry in &results.entries {
            for attr in &attrs {
                for value in entry.attributes.binaries(attr) {
                    match DecodedCertificate::decode(value) {
                        Ok(cert) => {
                            if snapshot.index_certificate(&entry.dn, &cert).is_some() {
                                indexed += 1;
                            }
                        }
                        Err(e) => {
                            debug!(dn = %entry.dn, attr = %attr, error = %e, "Skipping undecodable certificate");
                        }
                    }
                }
            }
        }
        self.index.publish(snapshot);
        info!(entries = results.entries.len(), certificates = indexed, "Rebuilt certificate index");
        Ok(indexed)
    }

    /// Run both tasks on the tokio runtime until `shutdown` fires or the
    /// provider goes stale.
    pub fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> MaintenanceHandle {
        let rebuild = tokio::spawn(run_periodic(
            Arc::clone(&self),
            MaintenanceTask::IndexRebuild,
            shutdown.subscribe(),
        ));
        let sweep = tokio::spawn(run_periodic(self, MaintenanceTask::CacheSweep, shutdown.subscribe()));
        MaintenanceHandle {
            tasks: vec![rebuild, sweep],
        }
    }
}

/// Join handles of the spawned maintenance tasks.
#[derive(Debug)]
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Wait for every task to stop.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
    }

    /// Whether every task has stopped.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}

#[derive(Debug, Clone, Copy)]
enum MaintenanceTask {
    IndexRebuild,
    CacheSweep,
}

impl MaintenanceTask {
    fn name(self) -> &'static str {
        match self {
            Self::IndexRebuild => "index_rebuild",
            Self::CacheSweep => "cache_sweep",
        }
    }

    fn interval(self, tunables: &Tunables) -> Duration {
        match self {
            Self::IndexRebuild => tunables.effective_index_rebuild_interval(),
            Self::CacheSweep => tunables.effective_cache_cleanup_interval(),
        }
    }

    fn run(self, maintenance: &IndexMaintenance) -> TaskStatus {
        match self {
            Self::IndexRebuild => maintenance.run_index_rebuild(),
            Self::CacheSweep => maintenance.run_cache_sweep(),
        }
    }
}

async fn run_periodic(
    maintenance: Arc<IndexMaintenance>,
    task: MaintenanceTask,
    mut shutdown: broadcast::Receiver<()>,
) {
    let tunables = maintenance.config.get().tunables.clone();
    let mut delay = tunables.maintenance_initial_delay;
    let mut interval = task.interval(&tunables);

    loop {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                debug!(task = task.name(), "Maintenance task shutting down");
                break;
            }
        }

        let worker = Arc::clone(&maintenance);
        let status = match tokio::task::spawn_blocking(move || task.run(&worker)).await {
            Ok(status) => status,
            Err(e) => {
                warn!(task = task.name(), error = %e, "Maintenance tick panicked");
                TaskStatus::Failed
            }
        };
        if status == TaskStatus::Cancelled {
            info!(task = task.name(), "Maintenance task cancelled");
            break;
        }

        let next = task.interval(&maintenance.config.get().tunables);
        if next != interval {
            info!(task = task.name(), old = ?interval, new = ?next, "Maintenance interval changed, rescheduling");
            interval = next;
        }
        delay = interval;
    }
}
