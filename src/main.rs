//! Rowcast - replicated row-change event distribution node
//!
//! Usage:
//!   rowcast [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   --listen <IP>          Broker listen IP (default: 0.0.0.0)
//!   --port <PORT>          Broker listen port (default: 9998)
//!   --data-dir <DIR>       Data directory for checkpoint and node key
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rowcast::config::Config;
use rowcast::node::Node;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Rowcast - replicated row-change event distribution node
#[derive(Parser, Debug)]
#[command(name = "rowcast")]
#[command(author = "Rowcast Contributors")]
#[command(version = "0.0.0-dev")]
#[command(about = "Replicated row-change event distribution engine")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker listen IP
    #[arg(long)]
    listen: Option<String>,

    /// Broker listen port
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for the checkpoint and the node key
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load the configuration file, default rowcast.toml. A missing file
    // falls back to built-in defaults; ROWCAST__* overrides always apply.
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("rowcast.toml"));
    let mut config = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_tracing_level().to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if args.config.is_some() {
        info!("Loaded configuration from {:?}", config_path);
    }

    // CLI args override file config
    if let Some(listen) = args.listen {
        config.broker.listen = listen;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Starting Rowcast node");
    info!("  Data dir: {}", config.node.data_dir.display());
    if config.broker.enable {
        info!(
            "  Broker: {}:{} ({} group(s))",
            config.broker.listen,
            config.broker.port,
            config.broker.groups.len()
        );
        for group in &config.broker.groups {
            info!(
                "    - {} [{}] filters={:?}",
                group.name, group.mode, group.filter
            );
        }
    } else {
        info!("  Broker: disabled");
    }
    if config.cluster.enable {
        info!("  Cluster: enabled ({})", config.cluster.consul_addr);
        info!("    Lock key: {}", config.cluster.lock_key);
        info!(
            "    Advertised: {}:{}",
            config.cluster.advertised_ip(),
            config.cluster.service_port.unwrap_or(config.broker.port)
        );
    } else {
        info!("  Cluster: disabled");
    }
    if config.cluster.enable && config.agent.enable {
        info!("  Agent: enabled");
    } else {
        info!("  Agent: disabled");
    }

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Error starting node: {}", e);
            std::process::exit(1);
        }
    };

    // Run the node (it handles Ctrl+C internally via the shutdown signal)
    Arc::new(node).run().await?;

    Ok(())
}
