//! `node-supervisor` binary.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (defaults, `WF_*` environment, flags) and validate
//! 2. Install logging on stderr
//! 3. Initialize the orchestrator (store, node, worker, status, snapshot)
//! 4. Serve the control surface on stdin/stdout until EOF or a signal
//! 5. Tear everything down in reverse order

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared_bus::EventFilter;
use tracing::{info, warn};

use node_supervisor::{
    init_tracing, open_store, ConfigOverrides, ControlSurface, Orchestrator, SupervisorConfig,
};

#[derive(Parser)]
#[command(author, version, about = "Local supervisor for Waterfall coordinator and validator nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and serve JSON requests on stdin/stdout
    Serve(ConfigOverrides),
    /// Apply pending store migrations and exit
    Migrate(ConfigOverrides),
}

fn load_config(overrides: &ConfigOverrides) -> Result<SupervisorConfig> {
    let mut config = SupervisorConfig::from_env().context("failed to read environment")?;
    config.apply(overrides);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(overrides) => serve(load_config(&overrides)?).await,
        Commands::Migrate(overrides) => migrate(load_config(&overrides)?),
    }
}

async fn serve(config: SupervisorConfig) -> Result<()> {
    init_tracing(&config.log).context("failed to initialize logging")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "node supervisor starting"
    );

    let orchestrator = Arc::new(Orchestrator::new(config).context("failed to build adapters")?);
    let surface = ControlSurface::new(Arc::clone(&orchestrator));
    // Subscribe before startup so recovery events reach the client.
    let events = orchestrator.bus().subscribe(EventFilter::default());

    orchestrator
        .initialize()
        .await
        .context("supervisor startup failed")?;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let served = tokio::select! {
        served = surface.serve(stdin, stdout, events) => {
            info!("control input closed");
            served.context("control surface failed")
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    orchestrator.destroy().await;
    served
}

fn migrate(config: SupervisorConfig) -> Result<()> {
    init_tracing(&config.log).context("failed to initialize logging")?;
    let store = open_store(&config).context("migration failed")?;
    info!(
        path = %config.store_path().display(),
        schema_version = store.schema_version(),
        "store is up to date"
    );
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
