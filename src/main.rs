//! Nexus Remoting - serves data-source plugins to a Nexus host.
//!
//! `connect` dials the host for a single connection and exits when it ends.
//! `serve` listens and accepts any number of connections.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use nexus_remoting::agent::{self, Agent, DEFAULT_LISTEN_ADDRESS};
use nexus_remoting::sample::{self, SampleDataSource};
use nexus_remoting::DataSourceRegistry;

#[derive(Parser)]
#[command(name = "nexus-remoting")]
#[command(version)]
#[command(about = "Remoting bridge between a Nexus host and data-source plugins")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a waiting host and serve one connection
    Connect {
        /// Host address
        #[arg(long, env = "NEXUS_REMOTING_ADDRESS", default_value = DEFAULT_LISTEN_ADDRESS)]
        address: String,
        /// Connection id announced on both sockets
        #[arg(long, env = "NEXUS_REMOTING_CONNECTION_ID")]
        connection_id: Uuid,
    },
    /// Listen for hosts and serve every connection
    Serve {
        #[arg(long, env = "NEXUS_REMOTING_LISTEN", default_value = DEFAULT_LISTEN_ADDRESS)]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout may belong to the host, so logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "nexus_remoting=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!("Starting Nexus Remoting v{}", env!("CARGO_PKG_VERSION"));

    let registry = DataSourceRegistry::new().register::<SampleDataSource>(sample::TYPE_NAME);

    match cli.command {
        Commands::Connect {
            address,
            connection_id,
        } => agent::connect(&address, connection_id, registry).await,
        Commands::Serve { listen } => Agent::bind(&listen, registry).await?.serve().await,
    }
}
