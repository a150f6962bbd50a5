//! svhost: multi-service TCP host.
//!
//! Hosts the services described by a configuration file, each on its own
//! port, plus a control service for managing them at runtime.
//!
//! Usage:
//!   svhost                                  # ~/.svhost/services.toml if present
//!   svhost services.toml                    # explicit configuration (TOML or JSON)
//!   svhost --max-connections 200            # override the global connection cap
//!   svhost --delayed-start-ms 5000          # when DELAYED_START services come up
//!   svhost --verbose --log-file             # debug logs to ~/.svhost/logs/svhost.log

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use svhost_protocol::HostConfig;
use svhost_server::{ServiceManager, control};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_DELAYED_START: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "svhost", about = "Multi-service TCP host")]
struct Cli {
    /// Service configuration file (.toml, otherwise JSON)
    config: Option<PathBuf>,

    /// Global connection cap, 0 for unlimited (overrides the config file)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Delay before DELAYED_START services are started (overrides the config file)
    #[arg(long)]
    delayed_start_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.svhost/logs/svhost.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        fail(e);
    }
    if let Err(e) = run(cli).await {
        fail(e);
    }
}

fn fail(error: anyhow::Error) -> ! {
    eprintln!("svhost: {error:#}");
    eprintln!();
    eprintln!("{}", Cli::command().render_usage());
    std::process::exit(1);
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let Some(ref log_file_arg) = cli.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    };

    let log_path = if log_file_arg == "DEFAULT" {
        svhost_dir().join("logs/svhost.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

fn svhost_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".svhost")
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(max) = cli.max_connections {
        config.max_connections = max;
    }
    ensure_control_passwords(&mut config);

    let manager = ServiceManager::new(config.max_connections);
    svhost_services::register_builtin(&manager);

    let loaded = manager.load(&config).await;
    info!(
        "Loaded {loaded} of {} configured service(s), global connection limit {}",
        config.services.len(),
        manager.max_connections()
    );

    let delay = cli
        .delayed_start_ms
        .or(config.delayed_start_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_DELAYED_START);
    let delayed = manager.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        delayed.start_delayed().await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("Shutting down...");
    manager.shutdown_all().await;
    info!("All services stopped");
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HostConfig> {
    if let Some(path) = path {
        return HostConfig::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()));
    }
    let default_path = svhost_dir().join("services.toml");
    if default_path.exists() {
        return HostConfig::load(&default_path)
            .with_context(|| format!("failed to load configuration {}", default_path.display()));
    }
    warn!("No configuration given and {} not found; starting empty", default_path.display());
    Ok(HostConfig::default())
}

/// Give every control service without a password a random one, logged once.
fn ensure_control_passwords(config: &mut HostConfig) {
    use rand::Rng;

    for service in &mut config.services {
        if service.implementation != control::IMPLEMENTATION
            || service.attributes.contains_key("password")
        {
            continue;
        }
        let bytes: [u8; 16] = rand::rng().random();
        let password = hex::encode(bytes);
        info!("Generated control password for '{}': {password}", service.name);
        service.set_attribute("password", password);
    }
}
