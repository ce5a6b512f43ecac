//! toolguard service.
//!
//! Loads the guard configuration, builds the [`GuardContext`], starts the
//! maintenance sweepers and serves the management API and channel until
//! SIGINT/SIGTERM.

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use toolguard::config::loader::load_config;
use toolguard::observability::{audit, logging, metrics};
use toolguard::{GuardConfig, GuardContext, GuardServer, Shutdown};

#[derive(Parser)]
#[command(name = "toolguard")]
#[command(about = "Trust-boundary guard service for local developer tooling", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose security logging (same as TOOLGUARD_DEBUG=1).
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GuardConfig::default(),
    };

    let verbose = logging::debug_enabled(cli.debug || config.observability.debug);
    logging::init_logging(&config.observability.log_level, verbose);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        debug_enabled = verbose,
        "toolguard starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let (ctx, writer) = GuardContext::from_config(config, verbose)?;
    if let Some(writer) = writer {
        tokio::spawn(writer.run());
    }
    audit::install(ctx.audit.clone());

    let shutdown = Shutdown::new();
    let maintenance = ctx.spawn_maintenance(&shutdown);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        toolguard::lifecycle::shutdown_signal().await;
        signal_shutdown.trigger();
    });

    if ctx.config.admin.enabled {
        let listener = TcpListener::bind(&ctx.config.admin.bind_address).await?;
        let server = GuardServer::new(ctx.clone(), shutdown.clone());
        server.run(listener).await?;
    } else {
        tracing::info!("Management API disabled; waiting for shutdown signal");
        shutdown.wait().await;
    }

    shutdown.trigger();
    for task in maintenance {
        let _ = task.await;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
