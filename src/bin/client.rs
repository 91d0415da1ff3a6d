//! Conduit Client
//!
//! Connects to a conduit server and relays every connection made to the
//! assigned public port (or subdomain) to a local service.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use conduit::{
    client::ClientPhase,
    config::{generate_example_config, ClientConfig, Config},
    Client,
};
use tracing::{error, info};

/// Conduit Client - expose a local port through a conduit server
#[derive(Parser, Debug)]
#[command(name = "conduit-client")]
#[command(about = "Conduit Client - expose a local port through a conduit server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Local port to expose (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Local host to expose
    #[arg(long)]
    local_host: Option<String>,

    /// Conduit server hostname
    #[arg(short, long)]
    server: Option<String>,

    /// Server control port
    #[arg(long)]
    control_port: Option<u16>,

    /// Specific public port to request
    #[arg(short, long)]
    remote_port: Option<u16>,

    /// Subdomain to request (requires a server hostname)
    #[arg(long)]
    subdomain: Option<String>,

    /// Shared secret if the server requires one
    #[arg(long, env = "CONDUIT_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Stay connected indefinitely instead of 24 hours
    #[arg(short, long)]
    keep_alive: bool,

    /// Seconds between keepalives
    #[arg(long)]
    keepalive_interval: Option<u64>,

    /// Seconds of silence before the server is considered gone
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example configuration")?;
        println!("{}", example);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config {
            client: Some(ClientConfig::default()),
            ..Config::default()
        },
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    apply_overrides(&mut client_config, args);

    info!("Conduit Client v{}", conduit::VERSION);
    info!(
        "Exposing {}:{} through {}",
        client_config.local_host, client_config.local_port, client_config.server
    );

    let client = Client::new(client_config).context("Invalid client configuration")?;
    let mut status = client.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if current.phase == ClientPhase::Active {
                if let Some(port) = current.assigned_port {
                    info!("Tunnel ready on public port {}", port);
                }
            }
        }
    });

    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                error!("{}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut ClientConfig, args: Args) {
    if let Some(port) = args.port {
        config.local_port = port;
    }
    if let Some(local_host) = args.local_host {
        config.local_host = local_host;
    }
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(control_port) = args.control_port {
        config.control_port = control_port;
    }
    if args.remote_port.is_some() {
        config.remote_port = args.remote_port;
    }
    if args.subdomain.is_some() {
        config.subdomain = args.subdomain;
    }
    if args.secret.is_some() {
        config.secret = args.secret;
    }
    if args.keep_alive {
        config.keep_alive = true;
    }
    if let Some(interval) = args.keepalive_interval {
        config.keepalive_interval = interval;
    }
    if let Some(timeout) = args.idle_timeout {
        config.idle_timeout = timeout;
    }
}
