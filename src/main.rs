//! BMS MQTT client - Main Entry Point

use bms_mqtt_client::config::{Config, FlagOverrides, SharedConfig, DEFAULT_CONFIG_PATH};
use bms_mqtt_client::engine::Engine;
use bms_mqtt_client::observability::init_logging;
use bms_mqtt_client::transport::mqtt::RumqttcSessionFactory;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Long-running MQTT subscriber with persisted status
#[derive(Parser)]
#[command(name = "bms-mqtt-client")]
#[command(about = "Long-running MQTT subscriber with persisted runtime status")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Deployment environment (development, testing, production)
    #[arg(short, long, env = "BMS_ENV")]
    env: Option<String>,

    /// Debug mode; pins the log level to debug
    #[arg(short = 'x', long = "debug")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client until a signal or the stop file
    Start,
    /// Ask a running client to stop
    Stop,
    /// Print the status document
    Health,
    /// Write the default configuration file if absent
    Init,
    /// Show the effective configuration
    Config {
        #[arg(long)]
        show: bool,
    },
    /// Update the [app.mqtt] section
    Mqtt(MqttArgs),
    /// Update the [app.logging] section
    Logging(LoggingArgs),
}

#[derive(Args)]
struct MqttArgs {
    #[arg(long)]
    broker: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    qos: Option<u8>,
    #[arg(long, value_name = "BOOL")]
    clean_session: Option<bool>,
    #[arg(long, value_name = "SECS")]
    keep_alive: Option<u64>,
    #[arg(long, value_name = "BOOL")]
    reconnect_on_failure: Option<bool>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long, env = "BMS_MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Args)]
struct LoggingArgs {
    #[arg(long)]
    level: Option<String>,
    #[arg(long)]
    file_path: Option<String>,
    #[arg(long)]
    format: Option<String>,
    #[arg(long, value_name = "BOOL")]
    add_time: Option<bool>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let overrides = FlagOverrides {
        environment: cli.env.clone(),
        debug_mode: cli.debug,
    };

    let result = match cli.command {
        Commands::Start => start(&cli.config, overrides).await,
        Commands::Stop => request_stop(&cli.config),
        Commands::Health => print_health(&cli.config),
        Commands::Init => init_config(&cli.config),
        Commands::Config { show } => handle_config_command(&cli.config, overrides, show),
        Commands::Mqtt(args) => update_config(&cli.config, |config| args.apply(config)),
        Commands::Logging(args) => update_config(&cli.config, |config| args.apply(config)),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn start(path: &Path, overrides: FlagOverrides) -> CliResult {
    let shared = SharedConfig::load(path, overrides)?;
    let config = shared.snapshot();
    let log_level = init_logging(&config.app.logging, config.flags.debug_mode)?;

    info!(
        config = %path.display(),
        "Starting {} v{}",
        config.system.app_name,
        config.system.full_version()
    );

    let engine = match Engine::new(shared, log_level, Arc::new(RumqttcSessionFactory)) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed to initialize engine");
            return Err(e.into());
        }
    };
    if let Err(e) = engine.run().await {
        error!(error = %e, "Engine failed to start");
        return Err(e.into());
    }

    info!("Application shutdown complete");
    Ok(())
}

fn request_stop(path: &Path) -> CliResult {
    let config = Config::load_or_default(path)?;
    let stop_file = &config.runtime.stop_file;
    if let Some(parent) = stop_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(stop_file, b"")?;
    println!("Stop requested ({})", stop_file.display());
    Ok(())
}

fn print_health(path: &Path) -> CliResult {
    let config = Config::load_or_default(path)?;
    let persist_file = &config.runtime.persist_file;
    let content = std::fs::read(persist_file)
        .map_err(|e| format!("cannot read {}: {e}", persist_file.display()))?;
    let document: serde_json::Value = serde_json::from_slice(&content)?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

fn init_config(path: &Path) -> CliResult {
    if path.exists() {
        println!("Configuration already exists at {}", path.display());
        return Ok(());
    }
    Config::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn handle_config_command(path: &Path, overrides: FlagOverrides, show: bool) -> CliResult {
    let mut config = Config::load_or_default(path)?;
    config.apply_overrides(&overrides);

    if show {
        if !config.app.mqtt.password.is_empty() {
            config.app.mqtt.password = "***".to_string();
        }
        println!("{}", toml::to_string_pretty(&config)?);
    } else {
        println!("Configuration at {} is valid", path.display());
    }
    Ok(())
}

/// Edit the file in place; a running client picks the change up through its watcher
fn update_config(path: &Path, edit: impl FnOnce(&mut Config)) -> CliResult {
    let mut config = Config::load_or_default(path)?;
    edit(&mut config);
    config.validate()?;
    config.save_to_file(path)?;
    println!("Updated {}", path.display());
    Ok(())
}

impl MqttArgs {
    fn apply(self, config: &mut Config) {
        let mqtt = &mut config.app.mqtt;
        if let Some(v) = self.broker {
            mqtt.broker = v;
        }
        if let Some(v) = self.port {
            mqtt.port = v;
        }
        if let Some(v) = self.client_id {
            mqtt.client_id = v;
        }
        if let Some(v) = self.topic {
            mqtt.topic = v;
        }
        if let Some(v) = self.qos {
            mqtt.qos = v;
        }
        if let Some(v) = self.clean_session {
            mqtt.clean_session = v;
        }
        if let Some(v) = self.keep_alive {
            mqtt.keep_alive = v;
        }
        if let Some(v) = self.reconnect_on_failure {
            mqtt.reconnect_on_failure = v;
        }
        if let Some(v) = self.username {
            mqtt.username = v;
        }
        if let Some(v) = self.password {
            mqtt.password = v;
        }
    }
}

impl LoggingArgs {
    fn apply(self, config: &mut Config) {
        let logging = &mut config.app.logging;
        if let Some(v) = self.level {
            logging.level = v;
        }
        if let Some(v) = self.file_path {
            logging.file_path = v;
        }
        if let Some(v) = self.format {
            logging.format = v;
        }
        if let Some(v) = self.add_time {
            logging.add_time = v;
        }
    }
}
