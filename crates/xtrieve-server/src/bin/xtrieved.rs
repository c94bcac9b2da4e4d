//! The Xtrieve daemon.
//!
//! ```bash
//! # Defaults: 127.0.0.1:7419, ./data
//! xtrieved
//!
//! # Custom address and data directory
//! xtrieved --listen 0.0.0.0:7419 --data-dir /var/lib/xtrieve
//!
//! # Configuration file with flag overrides on top
//! xtrieved --config /etc/xtrieve/xtrieved.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xtrieve_engine::Engine;
use xtrieve_server::{Server, ServerConfig};

/// Btrieve 5.1 compatible record server.
#[derive(Parser, Debug)]
#[command(name = "xtrieved", version, about)]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "XTRIEVE_LISTEN")]
    listen: Option<String>,

    /// Data directory for relative file paths
    #[arg(short, long, value_name = "DIR", env = "XTRIEVE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Page cache capacity per open file, in pages
    #[arg(long, env = "XTRIEVE_CACHE_PAGES")]
    cache_pages: Option<usize>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter (e.g. info, xtrieve_engine=debug)
    #[arg(long, default_value = "info", env = "XTRIEVE_LOG")]
    log: String,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    println!();
    println!("Xtrieve Record Manager Version {}", env!("CARGO_PKG_VERSION"));
    println!("Btrieve 5.10 Compatible ISAM Database Engine");
    println!();

    std::fs::create_dir_all(&config.data_dir).context("failed to create data directory")?;
    info!(data_dir = %config.data_dir.display(), cache_pages = config.engine.cache_pages, "starting");

    let engine = Arc::new(Engine::new(config.engine.clone()));
    let server = Server::new(config, Arc::clone(&engine));
    let listener = server.bind().await?;

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    engine.shutdown();
    info!("server stopped");
    Ok(())
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path).context("failed to load config file")?,
        None => ServerConfig::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(cache_pages) = args.cache_pages {
        config.engine.cache_pages = cache_pages;
    }

    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
