//! logsock: a concurrent line-protocol log server
//!
//! Clients send newline-terminated packets over TCP. Each packet is
//! appended to a shared log file and the whole log is sent back.
//!
//! Features:
//! - One worker thread per connection, reaped as clients leave
//! - Periodic `timestamp:` records from a heartbeat thread
//! - Graceful shutdown on SIGINT/SIGTERM, including idle clients
//! - Optional daemon mode (`-d`)
//! - Configuration via CLI arguments or TOML file

mod config;
mod daemon;
mod error;
mod heartbeat;
mod logging;
mod runtime;
mod server;
mod shutdown;
mod storage;

use config::Config;
use server::Server;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Bind (and daemonize) before logging so the subscriber's output
    // survives the descriptor cleanup
    let server = Server::bind(config.clone())?;

    logging::init(&config)?;

    info!(
        listen = %server.local_addr(),
        daemon = config.daemon,
        data_file = %config.data_file.display(),
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "Starting logsock server"
    );

    server.run()?;
    Ok(())
}
