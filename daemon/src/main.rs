//! sigbox daemon
//!
//! Runs the signing agent on a Unix socket (or TCP), or with `--proxy` a
//! session-affine proxy in front of a pool of agents.

use anyhow::Result;
use clap::Parser;
use sigbox_cryptobox::SoftBoxFactory;
use sigbox_daemon::config::DaemonConfig;
use sigbox_daemon::{AgentServer, ProxyServer, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_CONFIG: &str = "sigboxd.toml";

const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

/// sigbox daemon - signing agent and session proxy
#[derive(Parser, Debug)]
#[command(name = "sigboxd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    silent: bool,

    /// Run as proxy instead of agent
    #[arg(long)]
    proxy: bool,

    /// Listen address: socket path, or host:port with --tcp / --proxy
    #[arg(short, long)]
    bind: Option<String>,

    /// Listen on TCP instead of a Unix socket
    #[arg(long)]
    tcp: bool,

    /// Hex stream key
    #[arg(short, long)]
    key: Option<String>,

    /// Idle session timeout in seconds
    #[arg(long)]
    keep_alive: Option<u64>,

    /// Backend port range for the proxy, low:high
    #[arg(long)]
    ports: Option<String>,
}

impl Args {
    /// Command-line settings as a config to merge over the file
    fn overrides(&self) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        if self.proxy {
            config.proxy.bind = self.bind.clone();
        } else {
            config.server.bind = self.bind.clone();
        }
        config.server.tcp = self.tcp;
        config.server.key = self.key.clone();
        config.server.silent = self.silent;
        if let Some(keep_alive) = self.keep_alive {
            config.server.keep_alive = keep_alive;
        }
        config.proxy.ports = self.ports.clone();
        config
    }
}

fn init_logging(verbose: bool, silent: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else if silent {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Resolves with the number of the first SIGINT or SIGTERM
async fn wait_for_signal() -> Result<i32> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let signo = tokio::select! {
        _ = interrupt.recv() => SIGINT,
        _ = terminate.recv() => SIGTERM,
    };
    Ok(signo)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let required = args.config.is_some();
    let path = args.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = DaemonConfig::load_or_default(&path, required).await?;
    config.merge(args.overrides());

    init_logging(args.verbose, config.server.silent)?;
    info!("sigbox daemon v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = metrics::start_server(&config.monitoring);

    let shutdown = wait_for_signal();
    let signo = if args.proxy {
        let proxy = ProxyServer::bind(&config).await?;
        info!("Proxy listening on {}", proxy.local_endpoint()?);
        proxy.run_until(shutdown).await?
    } else {
        let server = AgentServer::bind(&config, Arc::new(SoftBoxFactory)).await?;
        info!("Agent listening on {}", server.local_endpoint()?);
        server.run_until(shutdown).await?
    };

    metrics_handle.abort();
    warn!("Exiting on signal {}", signo);
    std::process::exit(128 + signo);
}
