//! wakegate: Wake-on-LAN proxy daemon.
//!
//! Accepts TCP/UDP connections on configured proxy ports, wakes the
//! backing host when it is asleep, and transparently relays traffic once
//! the target is reachable.

mod config;
mod error;
mod probe;
mod relay;
mod supervisor;
mod wol;

use clap::Parser;
use config::Config;
use std::path::PathBuf;
use supervisor::ProxyServer;
use tracing::{error, info};

/// wakegate — Wake-on-LAN proxy
#[derive(Parser, Debug)]
#[command(name = "wakegate", version, about = "Wake-on-LAN proxy")]
struct Cli {
    /// Config file path (TOML; `.json` files are parsed as JSON)
    #[arg(long, default_value = "wakegate.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = expand_tilde(&cli.config);
    let config = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("wakegate: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing: RUST_LOG wins, then --log-level, then the config.
    use tracing_subscriber::EnvFilter;
    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        services = config.services.len(),
        "starting wakegate"
    );

    let server = ProxyServer::new(config);
    if server.start().await == 0 {
        error!("no services could be started");
        server.stop().await;
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");
    server.stop().await;
    info!("wakegate stopped");
}

/// Expand `~` to the user's home directory.
fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
