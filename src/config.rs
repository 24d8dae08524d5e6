//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const SERVER_USAGE: &str =
    "usage: echo-bench server --port <PORT> --workers <N> [--strategy edge|level|thread]";
const CLIENT_USAGE: &str = "usage: echo-bench client --host <HOST> --port <PORT> --workers <N> \
     --clients <N> --data <DATA> --retransmits <N> [--duration-ms <MS>] [--strategy edge|level]";

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(author = "echo-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Multi-process TCP echo benchmark", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo responder
    Server(ServerArgs),
    /// Run the load-generating echo client
    Client(ClientArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker processes sharing the listening socket
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,

    /// Connection handling strategy
    #[arg(long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Maximum readiness events returned per wait
    #[arg(long)]
    pub events_capacity: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Remote host to connect to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Remote port to connect to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker processes
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,

    /// Total number of concurrent clients, split across workers
    #[arg(short, long)]
    pub clients: Option<usize>,

    /// Payload each client sends per transmit
    #[arg(short, long)]
    pub data: Option<String>,

    /// Number of retransmits per session after the initial send
    #[arg(short, long)]
    pub retransmits: Option<u32>,

    /// Run duration in milliseconds; runs until interrupted when omitted
    #[arg(short = 't', long)]
    pub duration_ms: Option<u64>,

    /// Connection handling strategy
    #[arg(long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Maximum readiness events returned per wait
    #[arg(long)]
    pub events_capacity: Option<usize>,
}

/// How a worker process multiplexes its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Edge-triggered epoll reactor.
    #[default]
    Edge,
    /// Level-triggered poll(2) loop.
    Level,
    /// One blocking thread per accepted connection (server only).
    Thread,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub strategy: Option<Strategy>,
    pub events_capacity: Option<usize>,
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub clients: Option<usize>,
    pub data: Option<String>,
    pub retransmits: Option<u32>,
    pub duration_ms: Option<u64>,
    pub strategy: Option<Strategy>,
    pub events_capacity: Option<usize>,
    pub buffer_size: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const DEFAULT_SERVER_EVENTS: usize = 256;
const DEFAULT_CLIENT_EVENTS: usize = 2048;
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Resolved responder settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
    pub strategy: Strategy,
    pub events_capacity: usize,
    pub buffer_size: usize,
}

/// Resolved load-generator settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub clients: usize,
    pub payload: Vec<u8>,
    pub retransmits: u32,
    pub duration: Option<Duration>,
    pub strategy: Strategy,
    pub events_capacity: usize,
    pub buffer_size: usize,
}

impl ClientConfig {
    /// Total sends per session: the initial transmit plus every retransmit.
    pub fn transmit_budget(&self) -> u32 {
        self.retransmits.saturating_add(1)
    }

    /// Run duration in whole milliseconds, saturating at `u64::MAX`.
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_parse()?;
        Self::from_cli(cli)
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let mode = match cli.command {
            Command::Server(args) => Mode::Server(resolve_server(args, toml_config.server)?),
            Command::Client(args) => Mode::Client(resolve_client(args, toml_config.client)?),
        };

        Ok(Config { log_level, mode })
    }
}

fn resolve_server(args: ServerArgs, file: ServerSection) -> Result<ServerConfig, ConfigError> {
    let missing = |option| ConfigError::Missing {
        option,
        usage: SERVER_USAGE,
    };

    let port = args.port.or(file.port).ok_or_else(|| missing("port"))?;
    let workers = args.workers.or(file.workers).ok_or_else(|| missing("workers"))?;
    if workers == 0 {
        return Err(ConfigError::Invalid {
            name: "workers",
            reason: "at least one worker process is required",
        });
    }

    Ok(ServerConfig {
        port,
        workers,
        strategy: args.strategy.or(file.strategy).unwrap_or_default(),
        events_capacity: args
            .events_capacity
            .or(file.events_capacity)
            .unwrap_or(DEFAULT_SERVER_EVENTS),
        buffer_size: file.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
    })
}

fn resolve_client(args: ClientArgs, file: ClientSection) -> Result<ClientConfig, ConfigError> {
    let missing = |option| ConfigError::Missing {
        option,
        usage: CLIENT_USAGE,
    };

    let host = args.host.or(file.host).ok_or_else(|| missing("host"))?;
    let port = args.port.or(file.port).ok_or_else(|| missing("port"))?;
    let workers = args.workers.or(file.workers).ok_or_else(|| missing("workers"))?;
    let clients = args.clients.or(file.clients).ok_or_else(|| missing("clients"))?;
    let data = args.data.or(file.data).ok_or_else(|| missing("data"))?;
    let retransmits = args
        .retransmits
        .or(file.retransmits)
        .ok_or_else(|| missing("retransmits"))?;

    if workers == 0 {
        return Err(ConfigError::Invalid {
            name: "workers",
            reason: "at least one worker process is required",
        });
    }
    if clients == 0 {
        return Err(ConfigError::Invalid {
            name: "clients",
            reason: "at least one client is required",
        });
    }
    if data.is_empty() {
        return Err(ConfigError::Invalid {
            name: "data",
            reason: "payload must not be empty",
        });
    }

    let strategy = args.strategy.or(file.strategy).unwrap_or_default();
    if strategy == Strategy::Thread {
        return Err(ConfigError::Invalid {
            name: "strategy",
            reason: "the thread strategy is only available to the server",
        });
    }

    Ok(ClientConfig {
        host,
        port,
        workers,
        clients,
        payload: data.into_bytes(),
        retransmits,
        duration: args
            .duration_ms
            .or(file.duration_ms)
            .map(Duration::from_millis),
        strategy,
        events_capacity: args
            .events_capacity
            .or(file.events_capacity)
            .unwrap_or(DEFAULT_CLIENT_EVENTS),
        buffer_size: file.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
    })
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Cli(#[from] clap::Error),

    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("missing required option '--{option}'\n{usage}")]
    Missing {
        option: &'static str,
        usage: &'static str,
    },

    #[error("invalid value for '--{name}': {reason}")]
    Invalid {
        name: &'static str,
        reason: &'static str,
    },
}
