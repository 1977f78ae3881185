//! Gateway Simulator - Main Entry Point
//!
//! Connects one simulated gateway to its broker and keeps the session alive
//! until interrupted.

use clap::{Parser, Subcommand};
use gateway_sim::config::{ConfigError, GatewayConfiguration, SimulatorConfig};
use gateway_sim::observability::init_default_logging;
use gateway_sim::transport::mqtt::{ConnectionState, LifecycleNotice, MqttTransport};
use gateway_sim::transport::Transport;
use gateway_sim::{SimulatorError, SimulatorResult};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

/// How long a graceful disconnect may take before the transport is closed
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_CONFIG_PATHS: &[&str] = &["gateway.toml", "config/gateway.toml"];

/// IoT gateway simulator
#[derive(Parser)]
#[command(name = "gateway-sim")]
#[command(about = "Simulated IoT gateway speaking MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Account name (overrides the configuration file)
    #[arg(long, env = "SIMULATOR_ACCOUNT_NAME")]
    account_name: Option<String>,

    /// Client id (overrides the configuration file)
    #[arg(long, env = "SIMULATOR_CLIENT_ID")]
    client_id: Option<String>,

    /// Broker URL, may embed user:password (overrides the configuration file)
    #[arg(long, env = "SIMULATOR_BROKER_URL", hide_env_values = true)]
    broker_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the simulated gateway and run until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration, password redacted
        #[arg(long)]
        show: bool,
    },
}

impl Cli {
    fn has_full_identity(&self) -> bool {
        self.account_name.is_some() && self.client_id.is_some() && self.broker_url.is_some()
    }

    fn apply_overrides(&self, gateway: &GatewayConfiguration) -> GatewayConfiguration {
        GatewayConfiguration::new(
            self.account_name
                .clone()
                .unwrap_or_else(|| gateway.account_name().to_string()),
            self.client_id
                .clone()
                .unwrap_or_else(|| gateway.client_id().to_string()),
            self.broker_url
                .clone()
                .unwrap_or_else(|| gateway.broker_url().to_string()),
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting gateway simulator v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_simulator(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(cli: &Cli) -> SimulatorResult<SimulatorConfig> {
    let path = cli.config.clone().or_else(|| {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    });

    let mut config = match path {
        Some(path) => load_file(&path)?,
        None if cli.has_full_identity() => {
            SimulatorConfig::new(GatewayConfiguration::new("", "", ""))
        }
        None => {
            return Err(SimulatorError::runtime(
                "No configuration file found. Provide one with -c/--config, create gateway.toml, \
                 or pass --account-name, --client-id and --broker-url",
            ));
        }
    };

    config.gateway = cli.apply_overrides(&config.gateway);
    config.validate()?;
    Ok(config)
}

fn load_file(path: &Path) -> SimulatorResult<SimulatorConfig> {
    info!("Loading configuration from: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(ConfigError::from)?;
    // Validated after the command-line overrides are applied
    Ok(toml::from_str(&content).map_err(ConfigError::from)?)
}

async fn run_simulator(config: SimulatorConfig) -> SimulatorResult<()> {
    info!(
        account_name = %config.gateway.account_name(),
        client_id = %config.gateway.client_id(),
        "Simulated gateway starting"
    );

    let transport = MqttTransport::new(&config)?;
    transport.when_connected(Arc::new(|| info!("Gateway connected")));
    transport.when_disconnected(Arc::new(|| warn!("Gateway disconnected")));

    let mut notices = transport.notices();
    let observer = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            if let LifecycleNotice::Connected { reconnected: true } = notice {
                info!("Session restored after reconnection");
            }
        }
    });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    transport.connect();

    info!("Gateway is running, waiting for SIGINT or SIGTERM");
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    transport.disconnect();
    let mut state_rx = transport.watch_state();
    let settled = timeout(
        DISCONNECT_GRACE,
        state_rx.wait_for(|state| *state == ConnectionState::Disconnected),
    )
    .await
    .is_ok();
    if !settled {
        warn!("Disconnect did not complete within {:?}", DISCONNECT_GRACE);
    }

    let closed = transport.close();
    observer.abort();
    closed?;
    Ok(())
}

fn handle_config_command(config: &SimulatorConfig, show: bool) -> SimulatorResult<()> {
    if show {
        let display = SimulatorConfig {
            gateway: config.gateway.redacted(),
            mqtt: config.mqtt.clone(),
        };
        let rendered = toml::to_string_pretty(&display)
            .map_err(|e| SimulatorError::runtime(format!("Failed to render configuration: {e}")))?;
        println!("Current configuration:");
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
