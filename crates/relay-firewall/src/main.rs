//! relay-firewall: P2P firewall relay.
//!
//! Bridges outbound broker queues to mutually authenticated TLS peers and
//! terminates inbound peer sessions, in one process or split between an
//! inner process and a DMZ-facing outer process.

use clap::Parser;
use relay_core::names::sni_host_for;
use relay_firewall::activation::{InMemoryLeaseStore, LeaseStore};
use relay_firewall::broker::{Broker, InMemoryBroker};
use relay_firewall::{Firewall, FirewallConfig, FirewallMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Command-line entry point for the firewall relay
#[derive(Parser, Debug)]
#[command(name = "relay-firewall", version, about = "P2P firewall relay")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.relay/firewall.toml")]
    config: String,

    /// Deployment mode (sender_receiver, bridge_inner, bridge_outer, float_inner, float_outer)
    #[arg(long)]
    mode: Option<FirewallMode>,

    /// Public listen address (repeatable); replaces the configured list
    #[arg(long)]
    listen: Vec<String>,

    /// Write a development CA and peer identity to this directory, then exit
    #[arg(long, value_name = "DIR")]
    generate_dev_pki: Option<PathBuf>,

    /// Legal name for the generated development identity
    #[arg(long, default_value = "O=Relay Dev, L=London, C=GB")]
    legal_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Some(dir) = &cli.generate_dev_pki {
        match generate_dev_pki(dir, &cli.legal_name) {
            Ok(()) => {
                info!(dir = %dir.display(), legal_name = %cli.legal_name, "generated development PKI");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to generate development PKI");
                std::process::exit(1);
            }
        }
    }

    let config_path = PathBuf::from(&cli.config);
    let config = match FirewallConfig::load(Some(&config_path), cli.mode, &cli.listen) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.mode,
        identity = %config.identity,
        "starting relay-firewall"
    );

    let (broker, lease_store) = if config.mode.is_outer() {
        (None, None)
    } else {
        match embedded_services(&config).await {
            Ok((broker, store)) => (Some(broker), Some(store)),
            Err(e) => {
                error!(error = %e, "failed to prepare broker");
                std::process::exit(1);
            }
        }
    };

    let firewall = match Firewall::new(config, broker, lease_store).await {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "failed to create firewall");
            std::process::exit(1);
        }
    };

    if let Err(e) = firewall.start().await {
        error!(error = %e, "failed to start firewall");
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");
    firewall.stop().await;
    info!("relay-firewall stopped");
}

/// Broker and lease store living inside this process.
///
/// External broker clients are not linked in; a configured `[broker]`
/// address is reported and the embedded broker is used instead.
async fn embedded_services(
    config: &FirewallConfig,
) -> relay_core::RelayResult<(Arc<dyn Broker>, Arc<dyn LeaseStore>)> {
    if let Some(b) = &config.broker {
        warn!(
            address = %b.address,
            alternates = b.alternates.len(),
            "no external broker client available, using the embedded in-memory broker"
        );
    }
    let broker = Arc::new(InMemoryBroker::new());
    for id in &config.inbound.identities {
        broker.create_queue(&id.inbox).await?;
    }
    if config.mode == FirewallMode::SenderReceiver || config.mode.is_inner() {
        info!("lease store is process-local; run a single instance per broker");
    }
    Ok((broker, Arc::new(InMemoryLeaseStore::new())))
}

/// Write `ca.pem`, `identity.pem` and `identity.key` for local testing.
///
/// The identity certificate carries the server name peers derive from
/// `legal_name`, plus `localhost`.
fn generate_dev_pki(dir: &std::path::Path, legal_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;

    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "relay-firewall dev root");
    let ca_key = rcgen::KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut params = rcgen::CertificateParams::new(vec![sni_host_for(legal_name), "localhost".to_string()])?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, legal_name);
    let key = rcgen::KeyPair::generate()?;
    let cert = params.signed_by(&key, &ca_cert, &ca_key)?;

    std::fs::write(dir.join("ca.pem"), ca_cert.pem())?;
    std::fs::write(dir.join("identity.pem"), cert.pem())?;
    std::fs::write(dir.join("identity.key"), key.serialize_pem())?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
