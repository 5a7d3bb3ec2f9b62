//! tunpool client
//!
//! Runs a local SOCKS5 proxy and carries every accepted session to the
//! tunnel server over a pool of reusable encrypted connections.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunpool::{
    client::{serve_stats, TunnelClient},
    config::{generate_example_config, Config, LoggingConfig},
    crypto::derive_key,
    pool::ConnectionPool,
    transport::TcpDialer,
};

/// tunpool client - SOCKS5 front-end for a connection-reusing tunnel
#[derive(Parser, Debug)]
#[command(name = "tunpool-client")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Local SOCKS5 listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Tunnel server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

fn init_logging(level: Option<&str>, logging: &LoggingConfig) {
    let filter = EnvFilter::new(level.unwrap_or(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_example_config().to_toml()?);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(args.log_level.as_deref(), &config.logging);

    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(listen) = args.listen {
        client_config.listen = listen;
    }
    if let Some(server) = args.server {
        client_config.server = server;
    }

    let key = derive_key(&client_config.password).context("Invalid password")?;
    let dialer = TcpDialer::new(client_config.server.clone(), client_config.transport());
    let pool = Arc::new(ConnectionPool::new(dialer, key, client_config.pool_capacity));

    if let Some(stats_listen) = &client_config.stats_listen {
        let listener = TcpListener::bind(stats_listen)
            .await
            .with_context(|| format!("Failed to bind stats listener on {}", stats_listen))?;
        tokio::spawn(serve_stats(listener, pool.clone()));
    }

    let client = TunnelClient::bind(&client_config.listen, pool)
        .await
        .context("Failed to bind SOCKS5 listener")?;

    info!(
        "tunpool client v{} forwarding to {} (pool capacity {})",
        tunpool::VERSION,
        client_config.server,
        client_config.pool_capacity
    );

    tokio::select! {
        result = client.run() => result.context("SOCKS5 listener failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
