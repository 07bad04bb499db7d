//! Process entry point (§4.12): parse args, load and validate config,
//! install the tracing subscriber, construct the distributor, dispatch the
//! subcommand. No business logic lives here — each arm delegates straight
//! to the facade (component G) or the HTTP server (component E).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_p2p_distributor::config::Config;
use fleet_p2p_distributor::distributor::Distributor;
use fleet_p2p_distributor::metrics;
use fleet_p2p_distributor::server::{self, ServerState};
use fleet_p2p_distributor::swarm::LibrqbitSwarmClient;
use fleet_p2p_distributor::types::ArtifactId;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Fleet-internal peer-to-peer model-artifact distributor.
#[derive(Parser)]
#[command(about, version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed an artifact already present at `path` under the given id.
    Seed { path: PathBuf, id: String },
    /// Fetch an artifact from fleet peers and place it at `dest`.
    Fetch {
        id: String,
        dest: PathBuf,
        #[arg(long, default_value_t = 1800)]
        timeout_secs: u64,
    },
    /// Run the metainfo HTTP server (component E) until interrupted.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_env().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let metrics_handle = metrics::install().context("installing metrics recorder")?;

    let swarm = Arc::new(
        LibrqbitSwarmClient::new(&config)
            .await
            .context("starting swarm engine")?,
    );
    let distributor = Arc::new(Distributor::new(config.clone(), swarm));

    match args.command {
        Command::Seed { path, id } => {
            let id = ArtifactId::parse(&id).context("invalid artifact id")?;
            distributor.seed_model(&path, &id).await.context("seeding artifact")?;
            info!(artifact_id = %id, "now seeding");
        }
        Command::Fetch { id, dest, timeout_secs } => {
            let id = ArtifactId::parse(&id).context("invalid artifact id")?;
            let cancellation = CancellationToken::new();
            distributor
                .try_p2p_download(&id, &dest, Duration::from_secs(timeout_secs), &cancellation)
                .await
                .context("p2p download")?;
            info!(artifact_id = %id, dest = %dest.display(), "download complete");
        }
        Command::Serve => {
            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.metainfo_port));
            let router = server::router(ServerState {
                distributor: distributor.clone(),
                metrics_handle,
            });
            info!(%addr, "metainfo server listening");
            let listener = tokio::net::TcpListener::bind(addr).await.context("binding metainfo server")?;
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("running metainfo server")?;
            distributor.close();
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
