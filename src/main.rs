//! marathon-acme - automatic ACME certificates for Marathon apps
//!
//! Main entry point: parse and validate the command line, set up tracing,
//! wire the clients, stores, and services for the chosen storage backend,
//! and hand control to the orchestrator until a shutdown signal arrives.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use marathon_acme::acme::{
    AccountStore, AcmeIssuer, AcmeIssuingService, FileAccountStore, VaultAccountStore,
};
use marathon_acme::cert;
use marathon_acme::cli::{Cli, LogLevel};
use marathon_acme::clients::{MarathonClient, MarathonLbClient, VaultClient};
use marathon_acme::config::{Config, StorageBackend};
use marathon_acme::orchestrator::Orchestrator;
use marathon_acme::reconciler::Reconciler;
use marathon_acme::responder::{ChallengeResponder, Http01Responder};
use marathon_acme::server::HealthState;
use marathon_acme::store::{
    CertificateStore, DirCertificateStore, MlbCertificateStore, VaultKvCertificateStore,
};

#[tokio::main]
async fn main() -> ExitCode {
    // clap itself exits 2 on usage errors; config validation matches that.
    let cli = Cli::parse();
    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("marathon-acme: {}", e);
            return ExitCode::from(2);
        }
    };

    init_tracing(config.log_level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "marathon-acme exited with a fatal error");
            ExitCode::from(1)
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// `--log-level` seeds the default filter; `RUST_LOG` overrides it.
fn init_tracing(level: LogLevel) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("marathon_acme={}", level.as_filter())));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wire all components for the configured storage backend and run the
/// orchestrator until shutdown.
async fn run(config: Config) -> anyhow::Result<()> {
    let mlb = Arc::new(MarathonLbClient::new(
        config.lb_endpoints.clone(),
        config.lb_timeout,
    )?);

    let (store, account_store): (Arc<dyn CertificateStore>, Arc<dyn AccountStore>) =
        match &config.storage {
            StorageBackend::Directory(root) => {
                std::fs::create_dir_all(root)?;
                bootstrap_default_pem(root)?;
                (
                    Arc::new(DirCertificateStore::new(root)?),
                    Arc::new(FileAccountStore::new(root)),
                )
            }
            StorageBackend::Vault { mount } => {
                let vault = VaultClient::from_environ(config.vault_timeout)?;
                (
                    Arc::new(VaultKvCertificateStore::new(vault.clone(), mount.clone())),
                    Arc::new(VaultAccountStore::new(vault, mount.clone())),
                )
            }
        };

    // Every successful store triggers a marathon-lb USR1 reload.
    let store: Arc<dyn CertificateStore> =
        Arc::new(MlbCertificateStore::new(store, Arc::clone(&mlb)));

    let responder = Http01Responder::new();
    let acme: Arc<dyn AcmeIssuer> = Arc::new(AcmeIssuingService::new(
        config.acme_directory.to_string(),
        config.email.clone(),
        Arc::clone(&store),
        Arc::new(responder.clone()) as Arc<dyn ChallengeResponder>,
        account_store,
        config.renewal_days,
    ));

    let marathon = Arc::new(MarathonClient::new(
        config.marathon_endpoints.clone(),
        config.marathon_timeout,
        config.sse_options(),
    )?);

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&marathon),
        Arc::clone(&store),
        Arc::clone(&acme),
        config.group.clone(),
        config.allow_multiple_certs,
    ));

    let health = HealthState::new(config.event_failure_threshold);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    Orchestrator::new(config, marathon, reconciler, acme, responder, health)
        .run(shutdown)
        .await
}

/// Write the self-signed wildcard bootstrap certificate for HAProxy if it
/// does not exist yet.
fn bootstrap_default_pem(storage_root: &Path) -> anyhow::Result<()> {
    let path = storage_root.join("default.pem");
    if !path.exists() {
        info!(path = %path.display(), "Generating wildcard bootstrap certificate");
        std::fs::write(&path, cert::generate_wildcard_pem()?)?;
    }
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        error!(error = %e, "Could not install SIGTERM handler");
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("Received interrupt, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received interrupt, shutting down");
        }

        shutdown.cancel();
    });
}
