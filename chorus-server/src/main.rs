//! Chorus Server - coordination node of a clustered session backend
//!
//! Joins the leader election for its machine type, hosts the rooms it owns
//! and, while leader, recovers rooms from machines that went offline.
//!
//! Usage:
//!   chorus-server [OPTIONS]
//!
//! Configuration:
//!   TOML file (see `--print-config`), overridden by command line flags.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chorus_server::{BackendConfig, ChorusServerBuilder, ChorusServerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Memory,
    Redis,
}

/// Chorus Server - distributed room coordination
#[derive(Parser)]
#[command(
    name = "chorus-server",
    version = env!("CARGO_PKG_VERSION"),
    about = "Chorus Server - distributed room coordination",
    long_about = "Runs one machine of a chorus fleet: heartbeats, per-type leader election, \
room ownership and failover of rooms hosted by machines that went offline."
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    /// Machine type to elect a leader for
    #[arg(short = 't', long, value_name = "TYPE", help = "Machine type, e.g. RS or FE")]
    machine_type: Option<String>,

    /// Backend override
    #[arg(short, long, value_enum, help = "Store and transport backend")]
    backend: Option<BackendKind>,

    /// Redis URL, implies the redis backend
    #[arg(long, value_name = "URL", env = "CHORUS_REDIS_URL")]
    redis_url: Option<String>,

    /// Enable development mode
    #[arg(short = 'd', long, help = "Enable development mode (verbose logging)")]
    dev_mode: bool,

    /// Log level
    #[arg(
        short = 'l',
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)",
        default_value = "info"
    )]
    log_level: String,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", ChorusServerConfig::generate_example_config()?);
        return Ok(());
    }

    // Initialize logging
    let log_level = if args.dev_mode {
        "debug,chorus_server=trace,chorus_shared=debug".to_string()
    } else {
        format!("{},chorus_server=info,chorus_shared=info", args.log_level)
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(log_level),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(args.dev_mode)
                .with_file(args.dev_mode)
                .with_line_number(args.dev_mode),
        )
        .init();

    info!("🚀 Chorus Server Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if args.dev_mode {
        warn!("🔧 Development mode enabled");
    }

    let mut config = load_config(&args).await?;
    apply_cli_overrides(&mut config, &args)?;
    config.validate().context("invalid configuration")?;
    info!("🎯 Configuration loaded and CLI overrides applied");

    let server = ChorusServerBuilder::new()
        .with_config(config)
        .start()
        .await
        .context("failed to start coordination services")?;

    info!("✅ Machine {} ready", server.machine_id());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    server.shutdown().await?;
    info!("👋 Chorus Server shutdown complete");
    Ok(())
}

/// Load configuration from file or use defaults
async fn load_config(args: &Args) -> anyhow::Result<ChorusServerConfig> {
    match &args.config {
        Some(path) => {
            info!("📖 Loading config file {:?}", path);
            Ok(ChorusServerConfig::load_from_file(path).await?)
        }
        None => {
            info!("📄 No config file given, using defaults");
            Ok(ChorusServerConfig::default())
        }
    }
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut ChorusServerConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(machine_type) = &args.machine_type {
        config.server.machine_type = machine_type.clone();
    }

    let key_prefix = match &config.backend {
        BackendConfig::Redis { key_prefix, .. } => key_prefix.clone(),
        BackendConfig::Memory => "chorus".to_string(),
    };
    match (args.backend, &args.redis_url) {
        (Some(BackendKind::Memory), _) => config.backend = BackendConfig::Memory,
        (_, Some(url)) => {
            config.backend = BackendConfig::Redis {
                url: url.clone(),
                key_prefix,
            }
        }
        (Some(BackendKind::Redis), None) => {
            if !matches!(config.backend, BackendConfig::Redis { .. }) {
                anyhow::bail!("--backend redis requires --redis-url or a [backend] url");
            }
        }
        (None, None) => {}
    }

    if args.dev_mode {
        info!("🔧 Applying development mode configuration overrides");
    }
    Ok(())
}
