//! dirgate - directory identity provider
//!
//! Inspect and exercise a provider configuration from the command line.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

use dirgate::{
    LdapIdentityProvider,
    cert::DecodedCertificate,
    cli::{Cli, Command, OutputFormat},
    config::ProviderConfig,
    config_reload::ConfigWatcher,
    identity::{EntityKind, HeaderSet},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = ProviderConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = %config.name,
        endpoints = config.urls.len(),
        "Starting dirgate"
    );
    let format = cli.format;

    match cli.command {
        Command::Check => {
            let provider = build(config)?;
            let preferred = provider.failover().and_then(|t| t.current_url());
            print_value(format, &provider.stats(), || {
                println!("✅ configuration valid");
                if let Some(url) = &preferred {
                    println!("   preferred endpoint: {url}");
                }
            })?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Index => {
            let provider = Arc::new(build(config)?);
            let worker = Arc::clone(&provider);
            let indexed = tokio::task::spawn_blocking(move || worker.maintenance().rebuild_index())
                .await
                .context("Index task failed")?
                .context("Index rebuild failed")?;
            let stats = provider.stats();
            print_value(format, &stats, || {
                println!("Indexed {indexed} certificate(s)");
                println!(
                    "   issuer/serial: {}  ski: {}  thumbprint: {}  subject: {}",
                    stats.index.issuer_serial, stats.index.ski, stats.index.thumbprint, stats.index.subject
                );
            })?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Cert { file } => run_cert(config, &file, format).await,
        Command::Member { user, group } => {
            let provider = build(config)?;
            let result = blocking(move || {
                let Some(u) = provider.find_user_by_login(&user)? else {
                    bail!("no such user: {user}");
                };
                let Some(g) = provider.find_group_by_name(&group)? else {
                    bail!("no such group: {group}");
                };
                Ok((provider.is_member(&u, &g)?, u.dn, g.dn))
            })
            .await?;
            let (member, user_dn, group_dn) = result;
            print_value(format, &serde_json::json!({ "user": user_dn, "group": group_dn, "member": member }), || {
                if member {
                    println!("✅ {user_dn} is a member of {group_dn}");
                } else {
                    println!("❌ {user_dn} is not a member of {group_dn}");
                }
            })?;
            Ok(if member { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }
        Command::Groups { user } => {
            let provider = build(config)?;
            let headers = blocking(move || {
                let Some(u) = provider.find_user_by_login(&user)? else {
                    bail!("no such user: {user}");
                };
                Ok(provider.get_group_headers(&u)?)
            })
            .await?;
            print_headers(format, &headers)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Members { group } => {
            let provider = build(config)?;
            let headers = blocking(move || {
                let Some(g) = provider.find_group_by_name(&group)? else {
                    bail!("no such group: {group}");
                };
                Ok(provider.get_user_headers(&g)?)
            })
            .await?;
            print_headers(format, &headers)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Search {
            pattern,
            users_only,
            groups_only,
        } => {
            let kinds = match (users_only, groups_only) {
                (true, _) => vec![EntityKind::User],
                (_, true) => vec![EntityKind::Group],
                _ => vec![EntityKind::User, EntityKind::Group],
            };
            let provider = build(config)?;
            let headers = blocking(move || Ok(provider.search(&kinds, &pattern)?)).await?;
            print_headers(format, &headers)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch => run_watch(config, cli.config.as_deref()).await,
    }
}

fn build(config: ProviderConfig) -> anyhow::Result<LdapIdentityProvider> {
    LdapIdentityProvider::from_config(config).context("Failed to create provider")
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.context("Directory task failed")?
}

async fn run_cert(config: ProviderConfig, file: &Path, format: OutputFormat) -> anyhow::Result<ExitCode> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let cert = DecodedCertificate::decode(&bytes).context("Failed to decode certificate")?;
    let facets = cert.facets().clone();

    let provider = build(config)?;
    let thumbprint = facets.thumbprint_sha1.clone();
    let found = blocking(move || Ok(provider.find_cert_by_thumbprint_sha1(&thumbprint)?)).await?;
    let holder = found.as_ref().map(|r| r.subject_dn.clone());

    print_value(format, &serde_json::json!({ "facets": facets, "entry": holder }), || {
        println!("subject:    {}", facets.subject_display);
        println!("issuer:     {}", facets.issuer_dn);
        println!("serial:     {}", facets.serial);
        println!("thumbprint: {}", facets.thumbprint_sha1);
        if let Some(ski) = &facets.ski {
            println!("ski:        {ski}");
        }
        match &holder {
            Some(dn) => println!("✅ found on {dn}"),
            None => println!("❌ not found in directory"),
        }
    })?;
    Ok(if holder.is_some() { ExitCode::SUCCESS } else { ExitCode::from(2) })
}

async fn run_watch(config: ProviderConfig, path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let provider = build(config)?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let _watcher = match path {
        Some(p) => Some(
            ConfigWatcher::start(p.to_path_buf(), Arc::clone(provider.config()), shutdown_tx.subscribe())
                .context("Failed to start config watcher")?,
        ),
        None => None,
    };
    let handle = provider.spawn_maintenance(&shutdown_tx);
    info!("Maintenance running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());
    handle.join().await;
    info!(stats = %serde_json::to_string(&provider.stats())?, "Final statistics");
    Ok(ExitCode::SUCCESS)
}

fn print_value<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce()) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(),
    }
    Ok(())
}

fn print_headers(format: OutputFormat, headers: &HeaderSet) -> anyhow::Result<()> {
    print_value(format, headers, || {
        for header in headers {
            let kind = match header.kind {
                EntityKind::User => "user ",
                EntityKind::Group => "group",
            };
            match &header.login {
                Some(login) => println!("{kind}  {}  ({login})", header.dn),
                None => println!("{kind}  {}", header.dn),
            }
        }
        if headers.is_truncated() {
            println!("⚠️  result truncated, more entries exist");
        }
    })
}
