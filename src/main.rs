//! relaytap - transparent TCP relay with traffic inspection

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaytap::{
    config::{CliOverrides, ConfigManager, ConfigWatcher, InspectorReloader},
    control::{ConsoleExit, ControlConsole},
    inspect::build_inspector,
    metrics::{MetricsServer, RelayMetrics},
    Config, InspectorHandle, ShutdownCoordinator, Supervisor,
};

/// CLI arguments for relaytap
#[derive(Parser, Debug)]
#[command(name = "relaytap")]
#[command(about = "Transparent TCP relay with pluggable traffic inspection")]
#[command(version)]
#[command(long_about = "
relaytap - transparent TCP relay with pluggable traffic inspection

Accepts one client at a time on each configured port, connects it to the
upstream server, and forwards bytes unmodified in both directions while
handing a copy of every chunk to the configured inspector. When either side
disconnects the session is torn down and a new one starts immediately.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  RELAYTAP_PORT            - Local port to relay
  RELAYTAP_BIND_ADDR       - Local bind address (e.g., 0.0.0.0)
  RELAYTAP_UPSTREAM_HOST   - Upstream server host
  RELAYTAP_UPSTREAM_PORT   - Upstream server port (defaults to the local port)
  RELAYTAP_BUFFER_SIZE     - Read buffer size in bytes
  RELAYTAP_RESTART_DELAY   - Pause between sessions (e.g., 0s, 500ms)
  RELAYTAP_LOG_LEVEL       - Log level (trace, debug, info, warn, error)

Console commands: status, help, quit
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "relaytap.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Local port to relay (overrides config file)
    #[arg(short, long, help = "Local port to relay")]
    pub port: Option<u16>,

    /// Local bind address (overrides config file)
    #[arg(short, long, help = "Local bind address (e.g., 0.0.0.0)")]
    pub bind: Option<IpAddr>,

    /// Upstream host (overrides config file)
    #[arg(long, help = "Upstream server host")]
    pub upstream_host: Option<String>,

    /// Upstream port (overrides config file)
    #[arg(long, help = "Upstream server port")]
    pub upstream_port: Option<u16>,

    /// Buffer size in bytes
    #[arg(long, help = "Read buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Inspector kind (noop, log, capture)
    #[arg(long, help = "Inspector kind: noop, log or capture")]
    pub inspector: Option<String>,

    /// Capture file for the capture inspector
    #[arg(long, help = "Capture file path for --inspector capture")]
    pub capture: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Run without the interactive console
    #[arg(long, help = "Do not read commands from stdin")]
    pub no_console: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(&CliOverrides {
        port: args.port,
        bind_addr: args.bind,
        upstream_host: args.upstream_host.clone(),
        upstream_port: args.upstream_port,
        buffer_size: args.buffer_size,
        inspector: args.inspector.clone(),
        capture_path: args.capture.clone(),
    })?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&args, &config)?;

    info!("Starting relaytap v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    log_summary(&config);

    let inspector = InspectorHandle::new(
        build_inspector(&config.inspector).context("Failed to build inspector")?,
    );
    let metrics = Arc::new(RelayMetrics::new()?);
    let shutdown = ShutdownCoordinator::new();

    if config.metrics.enabled {
        let server = MetricsServer::new(metrics.clone(), config.metrics.bind_addr);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Metrics server error: {:#}", e);
            }
        });
    }

    // Keep the watcher alive for the lifetime of the process
    let _config_watcher = if args.config.exists() {
        match ConfigWatcher::new(args.config.clone()) {
            Ok(watcher) => {
                InspectorReloader::new(inspector.clone(), &config).spawn(watcher.subscribe());
                Some(watcher)
            }
            Err(e) => {
                warn!("Configuration hot reload disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let mut statuses = Vec::new();
    for relay in &config.relays {
        let supervisor = Arc::new(
            Supervisor::new(relay.clone(), inspector.clone()).with_metrics(metrics.clone()),
        );
        statuses.push(supervisor.subscribe());

        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await });
    }

    if !args.no_console {
        let console_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let input = tokio::io::BufReader::new(tokio::io::stdin());
            let mut console = ControlConsole::new(input, tokio::io::stdout(), statuses);
            match console.run().await {
                Ok(ConsoleExit::Quit) => console_shutdown.trigger(),
                Ok(ConsoleExit::EndOfInput) => info!("Console input closed, relays keep running"),
                Err(e) => error!("Console error: {:#}", e),
            }
        });
    }

    shutdown
        .run_until_shutdown(shutdown.listen_for_signals())
        .await;

    // Immediate exit: in-flight sessions are abandoned, and the blocking stdin
    // reader would otherwise hold the runtime open
    info!("relaytap stopped");
    std::process::exit(0);
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(&config.log_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}

fn log_summary(config: &Config) {
    for relay in &config.relays {
        info!(
            "Relay: {} -> {} (buffer {} bytes, restart delay {:?})",
            relay.listen_addr(),
            relay.upstream(),
            relay.buffer_size,
            relay.restart_delay
        );
    }
    info!("Inspector: {:?}", config.inspector);
    if config.metrics.enabled {
        info!("Metrics endpoint: http://{}/metrics", config.metrics.bind_addr);
    }
}
