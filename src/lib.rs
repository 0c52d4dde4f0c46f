//! dirgate Library
//!
//! Runtime core of a directory-backed identity provider: authenticates and
//! resolves users and groups against LDAP / Active Directory while shielding
//! callers from directory latency, outages and schema conventions.
//!
//! # Features
//!
//! - **Certificate index**: issuer+serial, SKI, thumbprint and subject DN
//!   lookups against a lock-free, periodically rebuilt snapshot
//! - **Certificate cache**: decoded certificates with a swept lifetime
//! - **Endpoint failover**: ordered directory URLs with time-boxed blacklisting
//! - **Nested groups**: depth-bounded, cycle-tolerant membership resolution
//!   over OU, login, DN and name-value member conventions
//! - **Hot reload**: tunables and schema mappings apply on the next call

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cert;
pub mod cli;
pub mod clock;
pub mod config;
pub mod config_reload;
pub mod directory;
pub mod dn;
pub mod error;
pub mod failover;
pub mod group;
pub mod identity;
pub mod maintenance;
pub mod provider;

pub use error::{Error, Result};
pub use provider::{Credentials, LdapIdentityProvider};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// [`Error::Internal`] when a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
