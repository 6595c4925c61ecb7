//! wsexec: expose any line-oriented program as a WebSocket service
//!
//! Every WebSocket connection spawns one instance of the configured program.
//! Each text message from the client becomes one line on the program's stdin,
//! and each line the program writes to stdout becomes one message back to the
//! client. The session ends as soon as either side closes or fails.
//!
//! Features:
//! - CGI-style environment (remote address, query string, headers) per connection
//! - Bounded output lines with a configurable overflow policy
//! - Optional SIGINT/SIGTERM/SIGKILL escalation for programs that outlive their pipes
//! - Configuration via CLI arguments or TOML file

mod config;
mod env;
mod error;
mod process;
mod relay;
mod server;
mod session;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        base_path = %config.base_path,
        command = %config.command,
        workers = ?config.workers,
        max_connections = config.max_connections,
        max_line_bytes = config.max_line_bytes,
        "Starting wsexec server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async move { Server::new(config).run().await })
}
