//! Configuration module for wsexec.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::process::{ProcessSpec, ReclaimPolicy};
use crate::relay::{LineLimit, Overflow};
use crate::session::SessionOptions;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "wsexec")]
#[command(author = "wsexec authors")]
#[command(version)]
#[command(about = "Expose a line-oriented program as a WebSocket service", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// URL path the WebSocket endpoint is served on
    #[arg(long)]
    pub base_path: Option<String>,

    /// Working directory for the spawned program
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Parent environment variable to pass to the program (repeatable)
    #[arg(long = "passenv", value_name = "NAME")]
    pub passenv: Vec<String>,

    /// Extra KEY=VALUE environment entry for the program (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Maximum length of one line of program output, in bytes
    #[arg(long)]
    pub max_line_bytes: Option<usize>,

    /// What to do with program output lines longer than --max-line-bytes
    #[arg(long, value_enum)]
    pub overlong_lines: Option<Overflow>,

    /// Grace period before signalling a program that outlives its pipes
    #[arg(long, value_name = "MS")]
    pub close_grace_ms: Option<u64>,

    /// Discard the program's stderr instead of inheriting it
    #[arg(long)]
    pub discard_stderr: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Program to run for each connection, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Connection cap
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// URL path of the endpoint
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            base_path: default_base_path(),
        }
    }
}

/// Spawned program configuration
#[derive(Debug, Deserialize)]
pub struct ProcessConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_passenv")]
    pub passenv: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub discard_stderr: bool,
    pub close_grace_ms: Option<u64>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_dir: None,
            passenv: default_passenv(),
            env: Vec::new(),
            discard_stderr: false,
            close_grace_ms: None,
        }
    }
}

/// Line relay configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default)]
    pub overlong_lines: Overflow,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            overlong_lines: Overflow::default(),
        }
    }
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

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_passenv() -> Vec<String> {
    vec!["PATH".to_string()]
}

fn default_max_line_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub base_path: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub passenv: Vec<String>,
    pub env: Vec<String>,
    pub discard_stderr: bool,
    pub close_grace: Option<Duration>,
    pub max_line_bytes: usize,
    pub overlong_lines: Overflow,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref path) = cli.config {
            let contents =
                std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                    path: path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            process,
            relay,
            logging,
        } = toml_config;

        // A command on the command line replaces both program and args from the file.
        let (command, args) = match cli.command.split_first() {
            Some((program, rest)) => (program.clone(), rest.to_vec()),
            None => match process.command {
                Some(program) => (program, process.args),
                None => return Err(ConfigError::MissingCommand),
            },
        };

        let base_path = cli.base_path.unwrap_or(server.base_path);
        if !base_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "base_path",
                reason: format!("'{base_path}' must start with '/'"),
            });
        }

        let max_line_bytes = cli.max_line_bytes.unwrap_or(relay.max_line_bytes);
        if max_line_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_line_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }

        let max_connections = cli.max_connections.unwrap_or(server.max_connections);
        if max_connections == 0 || max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: format!("must be between 1 and {}", Semaphore::MAX_PERMITS),
            });
        }

        let workers = cli.workers.or(server.workers);
        if workers == Some(0) {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut env = process.env;
        env.extend(cli.env);

        Ok(Config {
            listen: cli.listen.unwrap_or(server.listen),
            workers,
            max_connections,
            base_path,
            command,
            args,
            working_dir: cli.dir.or(process.working_dir),
            passenv: if cli.passenv.is_empty() {
                process.passenv
            } else {
                cli.passenv
            },
            env,
            discard_stderr: cli.discard_stderr || process.discard_stderr,
            close_grace: cli
                .close_grace_ms
                .or(process.close_grace_ms)
                .map(Duration::from_millis),
            max_line_bytes,
            overlong_lines: cli.overlong_lines.unwrap_or(relay.overlong_lines),
            log_level: cli.log_level.unwrap_or(logging.level),
        })
    }

    /// The program every session launches.
    pub fn process_spec(&self) -> ProcessSpec {
        ProcessSpec {
            program: self.command.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            discard_stderr: self.discard_stderr,
        }
    }

    /// Per-session relay and teardown options.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            line_limit: LineLimit {
                max_bytes: self.max_line_bytes,
                overflow: self.overlong_lines,
            },
            reclaim: match self.close_grace {
                Some(grace) => ReclaimPolicy::Escalate { grace },
                None => ReclaimPolicy::Detach,
            },
        }
    }
}
