//! edge-connector: a TCP edge device using epoll with bounded read timeouts.
//!
//! Subcommands:
//! - `serve`: accept clients and answer one JSON request per connection
//! - `request`: connect, send one request, print the reply and close
//!
//! Configuration via CLI arguments or TOML file.

use edge_connector::config::{Config, Mode};
use edge_connector::device;
use edge_connector::transport::Server;
use tracing::{error, info};
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

    match config.mode.clone() {
        Mode::Serve => run_server(config),
        Mode::Request { topic } => run_request(config, &topic),
    }
}

/// Bind and serve until the listener closes
fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        loop_mode = ?config.loop_mode,
        buffer_size = config.transport.buffer_size,
        "Starting edge connector server"
    );

    let mut server = Server::bind(&config.host, config.port, config.transport).map_err(|e| {
        error!(error = %e, "Socket initialization failed");
        e
    })?;

    device::serve(&mut server, config.loop_mode)?;
    server.shutdown()?;
    Ok(())
}

/// Send one request and print the reply
fn run_request(config: Config, topic: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!(host = %config.host, port = config.port, topic, "Sending request");

    let reply = device::request(&config.host, config.port, topic, config.transport)?;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}
