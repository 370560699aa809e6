//! Segment fabrication engine (mfab-engine) - Main entry point
//!
//! Loads configuration and content, opens the entity store and runs the
//! worker scheduler until Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mfab_common::config::FabricationConfig;
use mfab_common::events::EventBus;
use mfab_common::models::{Chain, ChainState, ChainType};
use mfab_common::time;
use mfab_engine::dub::{AudioSink, JsonManifestSink, NullSink};
use mfab_engine::store::{EntityStore, MemoryStore, SqliteStore};
use mfab_engine::work::{JsonFileContent, WorkContext, WorkManager};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Command-line arguments for mfab-engine
#[derive(Parser, Debug)]
#[command(name = "mfab-engine")]
#[command(about = "Segment fabrication engine")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "MFAB_CONFIG")]
    config: Option<PathBuf>,

    /// Content snapshot (JSON) bound to every chain
    #[arg(long, env = "MFAB_CONTENT")]
    content: PathBuf,

    /// SQLite database file, or "memory" for a throwaway in-memory store
    #[arg(short, long, default_value = "memory", env = "MFAB_DATABASE")]
    database: String,

    /// Directory receiving segment manifests; omitted means picks are discarded
    #[arg(short, long, env = "MFAB_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Create a production chain with this name and start fabricating it now
    #[arg(long)]
    create_chain: Option<String>,

    /// Seconds to wait for in-flight work on shutdown
    #[arg(long, default_value = "30")]
    shutdown_grace: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mfab_engine=info,mfab_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting mfab-engine v{}", env!("CARGO_PKG_VERSION"));

    let config = FabricationConfig::resolve(args.config.as_deref())
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let store: Arc<dyn EntityStore> = if args.database == "memory" {
        info!("Using in-memory entity store");
        Arc::new(MemoryStore::new())
    } else {
        let path = PathBuf::from(&args.database);
        Arc::new(
            SqliteStore::open(&path)
                .await
                .with_context(|| format!("Failed to open database {}", path.display()))?,
        )
    };

    let sink: Arc<dyn AudioSink> = match &args.output_dir {
        Some(dir) => {
            info!("Shipping segment manifests to {}", dir.display());
            Arc::new(JsonManifestSink::new(dir))
        }
        None => Arc::new(NullSink),
    };

    if let Some(name) = &args.create_chain {
        let mut chain = Chain::new(Uuid::new_v4(), name, ChainType::Production, time::now())
            .context("Invalid chain")?;
        chain.config = config.output.chain_config();
        chain.transition(ChainState::Ready)?;
        chain.transition(ChainState::Fabricate)?;
        store.put_chain(&chain).await.context("Failed to create chain")?;
        info!("Created chain {} ({})", chain.name, chain.ident());
    }

    let events = Arc::new(EventBus::default());
    let content = Arc::new(JsonFileContent::new(&args.content));
    let ctx = Arc::new(WorkContext::new(store, content, sink, config, events));

    let mut manager = WorkManager::new(ctx);
    manager.start();

    shutdown_signal().await;

    manager
        .shutdown(Duration::from_secs(args.shutdown_grace))
        .await;
    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
