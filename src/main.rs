//! kokoro-agent - host monitoring agent.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use kokoro::{Agent, AgentHandle, Config, SharedConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kokoro-agent", version, about = "Host monitoring agent")]
struct Args {
    /// Configuration file (JSON, or YAML for .yaml/.yml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", value_name = "FILTER")]
    log_level: String,

    /// Skip the one-time public address probe
    #[arg(long)]
    no_net_probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let (config, path) = Config::load(args.config.as_deref())
        .with_context(|| "failed to load configuration")?;
    info!(
        path = %path.display(),
        agent_id = %config.agent_id,
        controller = %config.master_ws_url,
        version = kokoro::protocol::AGENT_VERSION,
        "starting kokoro-agent"
    );

    let agent = Agent::builder(SharedConfig::new(config, path))
        .net_probe(!args.no_net_probe)
        .build();
    tokio::spawn(handle_signals(agent.handle()));

    agent.run().await.context("agent stopped with an error")
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// SIGHUP reloads the configuration and reconnects; SIGINT and SIGTERM stop.
#[cfg(unix)]
async fn handle_signals(handle: AgentHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let streams = (
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    );
    let (mut hangup, mut interrupt, mut terminate) = match streams {
        (Ok(hangup), Ok(interrupt), Ok(terminate)) => (hangup, interrupt, terminate),
        _ => {
            error!("failed to install signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload(&handle).await;
            }
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
        }
    }
    info!("shutdown requested");
    handle.stop();
}

#[cfg(unix)]
async fn reload(handle: &AgentHandle) {
    if let Err(e) = handle.reload().await {
        warn!(error = %e, "reload failed, keeping current configuration");
    }
}

#[cfg(not(unix))]
async fn handle_signals(handle: AgentHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown requested");
    handle.stop();
}
