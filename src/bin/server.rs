//! tunpool server
//!
//! Accepts tunnel connections and serves logical sessions on each of them
//! in place, connecting to the target named by each session.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunpool::{
    config::{generate_example_config, Config, LoggingConfig},
    crypto::derive_key,
    server::TunnelServer,
};

/// tunpool server - tunnel endpoint with in-place connection reuse
#[derive(Parser, Debug)]
#[command(name = "tunpool-server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

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

    let mut server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }

    let key = derive_key(&server_config.password).context("Invalid password")?;
    let server = TunnelServer::bind(&server_config.listen, key, server_config.max_connections)
        .await
        .context("Failed to bind tunnel listener")?;

    info!(
        "tunpool server v{} (max {} connections)",
        tunpool::VERSION,
        server_config.max_connections
    );

    tokio::select! {
        result = server.run() => result.context("Tunnel listener failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
