//! `hosterd`: load configuration, wire the engine, run the workers until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hoster_core::config::HosterConfig;
use hoster_engine::dns::PublicDnsResolver;
use hoster_engine::testing::LoggingUsageSink;
use hoster_engine::vault::CryptoVault;
use hoster_engine::workers;
use hoster_engine::{Engine, RegistryProviderFactory};
use hoster_runtime::pool::NodePool;
use hoster_store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "hosterd", about = "hoster control plane daemon", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "HOSTER_CONFIG", default_value = "/etc/hoster/hoster.toml")]
    config: PathBuf,

    /// Passphrase the vault key is derived from. Required unless --dev.
    #[arg(long, env = "HOSTER_VAULT_PASSPHRASE", hide_env_values = true)]
    vault_passphrase: Option<String>,

    /// Dev mode: in-memory state, an ephemeral vault key, and a logging
    /// billing sink. Nothing survives the process.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config: HosterConfig = if args.dev && !args.config.exists() {
        toml::from_str(r#"base_domain = "apps.localhost""#).expect("static dev config")
    } else {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", args.config.display()))?
    };
    config.validate().context("invalid configuration")?;

    let vault = match (&args.vault_passphrase, args.dev) {
        (Some(passphrase), _) => {
            CryptoVault::from_passphrase(passphrase, config.base_domain.as_bytes())
        }
        (None, true) => {
            use rand::RngCore;
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            info!("dev mode: ephemeral vault key");
            CryptoVault::new(&key)
        }
        (None, false) => anyhow::bail!("--vault-passphrase is required outside --dev"),
    };

    let store = Arc::new(MemoryStore::new());
    if !args.dev {
        // The durable store backend ships separately; until it is wired in,
        // a non-dev run would silently lose state on restart.
        info!("no durable store configured; running on the in-memory store");
    }

    let pool = Arc::new(
        NodePool::new(&config.local_node_host, &config.local_container_socket)
            .context("initializing node pool")?,
    );
    let resolver = Arc::new(PublicDnsResolver::new(config.dns_resolvers.clone()));

    let engine = Engine::new(
        store,
        pool,
        Arc::new(vault),
        config,
        Arc::new(RegistryProviderFactory),
        Arc::new(LoggingUsageSink),
        resolver,
    )?;

    let workers = workers::spawn_all(&engine);
    info!("hosterd up");

    shutdown_signal().await;
    info!("shutdown signal received");

    workers.shutdown().await;
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
