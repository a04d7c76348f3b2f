mod error;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fabric_api::{ClientTls, ServerTls};
use fabric_core::{Controller, CoreError, DiscoveryConfig, RealmSelector, SeedService};

use crate::error::DaemonError;

/// Fabric topology discovery daemon.
///
/// Watches the topology catalog for provisioned devices, polls their
/// agents for ports, links, and hosts, and reconciles the results back
/// into the catalog. Also serves the northbound seeding API.
#[derive(Debug, Parser)]
#[command(name = "fabricd", version, about)]
struct Args {
    /// host:port of the topology catalog service.
    #[arg(long, env = "FABRIC_CATALOG_ADDRESS", default_value = "fabric-catalog:5150")]
    catalog_address: String,

    /// Label selecting the devices this controller owns.
    #[arg(long, default_value = "pod")]
    realm_label: String,

    /// Value of the realm label.
    #[arg(long, default_value = "all")]
    realm_value: String,

    /// Label used to find devices in neighboring realms.
    #[arg(long, default_value = "pod")]
    neighbor_realm_label: String,

    /// Value of the realm label of devices in neighboring realms;
    /// empty disables neighbor monitoring.
    #[arg(long, default_value = "")]
    neighbor_realm_value: String,

    /// Bind address of the northbound seeding API.
    #[arg(long, default_value = "0.0.0.0:5150")]
    bind_address: String,

    /// PEM certificate chain for the northbound endpoint.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the northbound endpoint.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// CA certificate for catalog and agent connections; enables TLS.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Use TLS to catalog and agents without verifying certificates.
    #[arg(long)]
    insecure: bool,

    /// Seconds between full discovery sweeps.
    #[arg(long, default_value_t = 30)]
    sweep_interval_secs: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(err) = run(args).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

async fn run(args: Args) -> Result<(), DaemonError> {
    info!("starting fabricd");

    // Northbound TLS material is loaded before anything else so bad
    // material fails the process, not the first client.
    let server_tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(
            ServerTls::from_pem_files(cert, key)
                .map_err(|e| DaemonError::Tls { message: e.to_string() })?,
        ),
        (None, None) => None,
        _ => {
            return Err(DaemonError::Tls {
                message: "--tls-cert and --tls-key must be given together".into(),
            })
        }
    };

    let config = discovery_config(&args)?;
    config
        .validate()
        .map_err(|e| DaemonError::Config { message: e.to_string() })?;

    let listener = TcpListener::bind(&args.bind_address)
        .await
        .map_err(|source| DaemonError::Bind { address: args.bind_address.clone(), source })?;

    let controller = Controller::new(config).map_err(DaemonError::Core)?;
    controller.start().await;

    let cancel = CancellationToken::new();
    let service = SeedService::new(controller.clone());
    let serve_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(error) = service.serve(listener, server_tls, serve_cancel).await {
            warn!(%error, "northbound server stopped");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| DaemonError::Core(CoreError::Config(format!("signal handler failed: {e}"))))?;
    info!("shutdown requested");

    cancel.cancel();
    controller.stop().await;
    let _ = server.await;
    info!("fabricd stopped");
    Ok(())
}

fn discovery_config(args: &Args) -> Result<DiscoveryConfig, DaemonError> {
    let client_tls = if let Some(ca) = &args.ca_cert {
        ClientTls::CustomCa(ca.clone())
    } else if args.insecure {
        ClientTls::DangerAcceptInvalid
    } else {
        ClientTls::Plaintext
    };

    let neighbor_realm = if args.neighbor_realm_value.is_empty() {
        None
    } else {
        Some(RealmSelector::new(
            args.neighbor_realm_label.clone(),
            args.neighbor_realm_value.clone(),
        ))
    };

    Ok(DiscoveryConfig {
        catalog_address: args.catalog_address.clone(),
        realm: RealmSelector::new(args.realm_label.clone(), args.realm_value.clone()),
        neighbor_realm,
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        catalog_tls: client_tls.clone(),
        agent_tls: client_tls,
        ..DiscoveryConfig::default()
    })
}
