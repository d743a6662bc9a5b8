//! EmberMQ - MQTT 3.1.1 broker
//!
//! Usage:
//!   embermq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (TOML)
//!   -p, --port <PORT>      MQTT/TCP port (default: 1883)
//!   --host <HOST>          Bind host (default: 0.0.0.0)
//!   --ws-port <PORT>       MQTT/WebSocket port (disabled unless set)
//!   --max-connections <N>  Maximum connections
//!   -l, --log-level        Log level (error, warn, info, debug, trace)

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use embermq::auth::StaticAuth;
use embermq::broker::{Broker, BrokerConfig};
use embermq::config::Config;

/// Log level for the CLI
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

/// EmberMQ - MQTT 3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "embermq")]
#[command(version = "0.1.0")]
#[command(about = "MQTT 3.1.1 broker with persistent sessions and WebSocket transport")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind host
    #[arg(long)]
    host: Option<String>,

    /// MQTT/TCP port
    #[arg(short, long)]
    port: Option<u16>,

    /// MQTT/WebSocket port (enables the WebSocket listener)
    #[arg(long)]
    ws_port: Option<u16>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Worker threads (0 = available parallelism)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut file_config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("error reading configuration: {}", e);
                std::process::exit(1);
            }
        },
    };

    // CLI flags override file configuration
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if let Some(ws_port) = args.ws_port {
        file_config.server.ws_port = Some(ws_port);
    }
    if let Some(max) = args.max_connections {
        file_config.server.max_connections = max;
    }
    if let Some(workers) = args.workers {
        file_config.performance.worker_threads = workers;
    }

    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let worker_threads = if file_config.performance.worker_threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        file_config.performance.worker_threads
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(file_config, worker_threads))
}

async fn run(
    file_config: Config,
    worker_threads: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker_config = BrokerConfig::from_config(&file_config)?;

    info!("starting EmberMQ");
    info!("  bind address: {}", broker_config.bind_addr);
    if let Some(ws_addr) = &broker_config.ws_bind_addr {
        info!("  WebSocket address: {} ({})", ws_addr, broker_config.ws_path);
    }
    if broker_config.tls.is_some() {
        info!("  TLS: enabled");
    }
    info!("  workers: {}", worker_threads);
    info!("  max connections: {}", broker_config.max_connections);
    if file_config.security.require_auth {
        info!(
            "  authentication: required ({} users configured)",
            file_config.security.users.len()
        );
    } else {
        info!("  authentication: disabled");
    }
    if broker_config.persistence_enabled {
        info!(
            "  persistence: {} (session ttl {}s)",
            file_config.persistence.storage_type, file_config.persistence.session_ttl
        );
    } else {
        info!("  persistence: disabled");
    }

    let auth = Arc::new(StaticAuth::new(&file_config.security));
    let broker = Arc::new(Broker::with_auth(broker_config, auth));

    {
        let broker = broker.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl-C");
                broker.shutdown();
            }
        });
    }

    broker.run().await?;
    Ok(())
}
