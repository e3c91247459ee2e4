//! Deckhand - reconciliation worker for Kubernetes deployments
//!
//! This is the main CLI entry point for Deckhand.

use anyhow::Context;
use clap::{Parser, Subcommand};
use deckhand::cluster::status::{pod_logs, service_status};
use deckhand::cluster::{ClusterClientFactory, ClusterHandles, KubeConnector, LogOptions};
use deckhand::config::{WorkerArgs, WorkerConfig};
use deckhand::crypto::CredentialCipher;
use deckhand::dispatcher::Dispatcher;
use deckhand::health;
use deckhand::naming::{sanitize, DEFAULT_MAX_LEN};
use deckhand::reconcile::Reconciler;
use deckhand::store::{CatalogStore, PostgresStore, ServiceBundle};
use deckhand::DeckhandError;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Deckhand - Kubernetes reconciliation worker
#[derive(Parser)]
#[command(name = "deckhand")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Reconciliation worker that deploys declared services to Kubernetes", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(flatten)]
    worker: WorkerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker and its liveness endpoint (default)
    Run,

    /// Encrypt a value with the master key
    Seal {
        /// Value to encrypt; read from stdin when omitted
        value: Option<String>,
    },

    /// Show the deployment and pods of a service
    Status {
        /// Service ID
        service_id: String,
    },

    /// Print the logs of a service pod
    Logs {
        /// Service ID
        service_id: String,
        /// Pod name
        pod: String,
        /// Container name
        #[arg(short, long)]
        container: Option<String>,
        /// Number of lines to show
        #[arg(short = 'n', long)]
        tail: Option<i64>,
        /// Show logs of the previous container instance
        #[arg(short, long)]
        previous: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = WorkerConfig::from(cli.worker);
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_worker(config).await?,

        Commands::Seal { value } => {
            let value = match value {
                Some(value) => value,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("Failed to read value from stdin")?;
                    buffer.trim_end_matches(['\r', '\n']).to_string()
                }
            };
            let cipher = CredentialCipher::new(config.cipher_key()?);
            println!("{}", cipher.encrypt(&value)?);
        }

        Commands::Status { service_id } => {
            let (bundle, handles) = connect_service(&config, &service_id).await?;
            let status = service_status(&bundle, &handles).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Logs {
            service_id,
            pod,
            container,
            tail,
            previous,
        } => {
            let (bundle, handles) = connect_service(&config, &service_id).await?;
            let namespace = sanitize(&bundle.application.namespace, DEFAULT_MAX_LEN);
            let options = LogOptions {
                container,
                tail_lines: tail,
                previous,
            };
            print!("{}", pod_logs(&handles, &namespace, &pod, &options).await?);
        }
    }

    Ok(())
}

async fn connect_store(config: &WorkerConfig) -> anyhow::Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(config.database_url()?, config.max_connections)
        .await
        .context("Failed to connect to the store")?;
    Ok(Arc::new(store))
}

async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    info!("Starting deckhand worker");
    let cipher = CredentialCipher::new(config.cipher_key()?);
    let store = connect_store(&config).await?;

    let factory = ClusterClientFactory::new(
        store.clone(),
        Arc::new(KubeConnector::new()),
        cipher.clone(),
    );
    let reconciler = Reconciler::new(store.clone(), store.clone(), factory, cipher);
    let dispatcher = Dispatcher::new(store, reconciler, config.dispatcher());

    let (stop_tx, stop_rx) = watch::channel(false);
    let liveness = tokio::spawn(health::serve(config.liveness_addr(), stop_rx.clone()));
    let worker = tokio::spawn(async move { dispatcher.run(stop_rx).await });

    shutdown_signal().await?;
    info!("Shutdown signal received, finishing current task");
    let _ = stop_tx.send(true);

    worker.await?;
    liveness.await??;
    info!("Deckhand worker stopped");
    Ok(())
}

async fn connect_service(
    config: &WorkerConfig,
    service_id: &str,
) -> anyhow::Result<(ServiceBundle, ClusterHandles)> {
    let cipher = CredentialCipher::new(config.cipher_key()?);
    let store = connect_store(config).await?;

    let bundle = store
        .service_bundle(service_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Service {} not found", service_id))?;
    let cluster_id = bundle
        .application
        .cluster_id
        .clone()
        .ok_or_else(|| DeckhandError::ApplicationClusterMissing(bundle.application.id.clone()))?;

    let factory = ClusterClientFactory::new(store, Arc::new(KubeConnector::new()), cipher);
    let handles = factory.resolve(&cluster_id).await?;
    Ok((bundle, handles))
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
