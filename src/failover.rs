//! Directory endpoint failover.
//!
//! Tracks which configured directory URL is preferred. A caller whose
//! connection to the preferred URL fails reports it; the URL is blacklisted
//! and the first eligible endpoint (in configured order) takes over. A
//! blacklisted endpoint becomes eligible again once the retry timeout has
//! elapsed, which is only noticed by the next report: there is no timer.
//!
//! ```text
//!   current = a ──report(a)──▶ current = b ──report(b)──▶ current = none
//!                                                              │
//!                         retry timeout elapsed, report(none)  │
//!   current = a ◀──────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, duration_ms};
use crate::{Error, Result};

/// Preferred-endpoint tracker for one provider.
#[derive(Debug)]
pub struct UrlFailoverTracker {
    name: String,
    urls: Vec<String>,
    state: RwLock<EndpointTable>,
    retry_timeout_ms: AtomicU64,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct EndpointTable {
    current: Option<usize>,
    blacklisted_since: Vec<Option<u64>>,
}

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    /// Endpoint URL
    pub url: String,
    /// Currently preferred
    pub current: bool,
    /// Blacklist timestamp (ms since epoch), if blacklisted
    pub blacklisted_since_ms: Option<u64>,
}

impl UrlFailoverTracker {
    /// Track `urls`; the first one starts as preferred.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when `urls` is empty.
    pub fn new(
        name: impl Into<String>,
        urls: Vec<String>,
        retry_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let name = name.into();
        if urls.is_empty() {
            return Err(Error::Config(format!("provider '{name}' has no directory urls")));
        }
        let n = urls.len();
        Ok(Self {
            name,
            urls,
            state: RwLock::new(EndpointTable {
                current: Some(0),
                blacklisted_since: vec![None; n],
            }),
            retry_timeout_ms: AtomicU64::new(duration_ms(retry_timeout)),
            clock,
        })
    }

    /// Configured endpoints in order.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Apply a reloaded retry timeout.
    pub fn set_retry_timeout(&self, retry_timeout: Duration) {
        self.retry_timeout_ms
            .store(duration_ms(retry_timeout), Ordering::Relaxed);
    }

    /// The preferred URL, or `None` when every endpoint is blacklisted.
    pub fn current_url(&self) -> Option<String> {
        let state = self.state.read();
        state.current.map(|i| self.urls[i].clone())
    }

    /// Report that `failed_url` failed and pick the next endpoint.
    ///
    /// A report for a URL other than the preferred one is stale (another
    /// caller already moved on) and returns the preferred URL untouched.
    /// Passing `None` while nothing is preferred probes for an endpoint whose
    /// blacklist has expired.
    #[tracing::instrument(skip(self), fields(provider = %self.name))]
    pub fn report_failure_and_advance(&self, failed_url: Option<&str>) -> Option<String> {
        let mut state = self.state.write();
        let tracked = state.current.map(|i| self.urls[i].as_str());
        if failed_url != tracked {
            debug!(tracked = ?tracked, "Stale failure report ignored");
            return tracked.map(str::to_string);
        }

        let now = self.clock.now_ms();
        if let Some(i) = state.current {
            warn!(url = %self.urls[i], "Directory endpoint failed, blacklisting");
            state.blacklisted_since[i] = Some(now);
        }

        let retry_timeout = self.retry_timeout_ms.load(Ordering::Relaxed);
        let mut next = None;
        for (i, since) in state.blacklisted_since.iter_mut().enumerate() {
            match *since {
                None => {
                    next = Some(i);
                    break;
                }
                Some(t) if now.saturating_sub(t) > retry_timeout => {
                    info!(url = %self.urls[i], "Blacklist expired, retrying endpoint");
                    *since = None;
                    next = Some(i);
                    break;
                }
                Some(_) => {}
            }
        }
        state.current = next;

        match next {
            Some(i) => {
                info!(url = %self.urls[i], "Switched directory endpoint");
                Some(self.urls[i].clone())
            }
            None => {
                warn!("All directory endpoints are blacklisted");
                None
            }
        }
    }

    /// Snapshot of every endpoint.
    pub fn status(&self) -> Vec<EndpointStatus> {
        let state = self.state.read();
        self.urls
            .iter()
            .enumerate()
            .map(|(i, url)| EndpointStatus {
                url: url.clone(),
                current: state.current == Some(i),
                blacklisted_since_ms: state.blacklisted_since[i],
            })
            .collect()
    }
}
