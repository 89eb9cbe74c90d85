mod supervisor;

use anyhow::Context;
use ck_archive::SnapshotStore;
use ck_common::EnvConfig;
use ck_crypto::CryptoProvider;
use ck_lifecycle::{DeployDispatcher, LifecyclePipeline};
use ck_registry::CertificateRegistry;
use ck_scheduler::{CertWatcher, RenewalScheduler};
use ck_vault::PassphraseVault;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use supervisor::{ServicePriority, spawn_supervised};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let env = EnvConfig::load(None);

    let filter = match std::env::var("RUST_LOG").ok().or_else(|| env.log_level.clone()) {
        Some(spec) => tracing_subscriber::EnvFilter::try_new(spec)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        None => tracing_subscriber::EnvFilter::new("info,certkeep=debug"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("CertKeep starting...");

    // Fatal startup problems (unwritable directories, unreadable vault)
    // get a human-readable line on stderr and exit code 1.
    if let Err(e) = run(env).await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(env: EnvConfig) -> anyhow::Result<()> {
    for dir in [&env.config_dir, &env.certs_dir, &env.archive_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create directory {}", dir.display()))?;
    }

    let vault = Arc::new(
        PassphraseVault::open(&env.config_dir).context("cannot open passphrase vault")?,
    );
    let registry = Arc::new(
        CertificateRegistry::new(
            &env.certs_dir,
            &env.config_dir,
            CryptoProvider::new(),
            Arc::clone(&vault),
        )
        .context("cannot initialize certificate registry")?,
    );
    let snapshots = Arc::new(SnapshotStore::new(&env.archive_dir));
    let deploy = Arc::new(DeployDispatcher::new());
    let pipeline = Arc::new(LifecyclePipeline::new(
        Arc::clone(&registry),
        snapshots,
        deploy,
    ));

    registry
        .load_all(true)
        .await
        .context("initial reconcile failed")?;
    info!(
        certificates = registry.get_all().await.len(),
        certs_dir = %env.certs_dir.display(),
        "initial reconcile done"
    );

    let shutdown = CancellationToken::new();

    {
        let registry = Arc::clone(&registry);
        let cancel = shutdown.clone();
        spawn_supervised("cert-watcher", ServicePriority::Critical, move || {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            async move {
                CertWatcher::new(registry).run(cancel).await?;
                Ok(())
            }
        });
    }

    let scheduler = Arc::new(RenewalScheduler::new(Arc::clone(&pipeline)));
    {
        let scheduler = Arc::clone(&scheduler);
        let cancel = shutdown.clone();
        spawn_supervised("renewal-scheduler", ServicePriority::Background, move || {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            async move {
                scheduler.run(cancel).await?;
                Ok(())
            }
        });
    }

    // The HTTP API (axum) plugs in here; it lives outside the engine and
    // talks to `registry`, `pipeline` and `scheduler` through their handles.

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM])
        .context("cannot install signal handlers")?;
    while let Some(signal) = signals.next().await {
        match signal {
            SIGHUP => {
                info!("SIGHUP received, forcing full reconcile");
                if let Err(e) = registry.load_all(true).await {
                    error!(error = %e, "reconcile failed");
                }
            }
            SIGINT | SIGTERM => {
                info!("shutdown requested");
                shutdown.cancel();
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
