//! cairnd — the cairn peer daemon.
//!
//! Spawns the four background components — announcement broadcast,
//! announcement listener, staleness reaper, transfer server — around the
//! two shared indexes, then waits for SIGINT/SIGTERM and shuts the lot
//! down through one cancellation token.

use std::net::SocketAddrV4;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use cairn_core::CairnConfig;
use cairn_services::{LocalCatalog, PeerRegistry};
use cairnd::{announce, transfer};

const USAGE: &str = "usage: cairnd <node_id> <udp_port> <broadcast_port> <tcp_port> [simulate_drops:0|1]";

struct Args {
    node_id: u32,
    sender_port: u16,
    broadcast_port: u16,
    tcp_port: u16,
    simulate_drops: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let node_id = args
            .next()
            .context("missing argument <node_id>")?
            .parse()
            .context("invalid <node_id>")?;
        let sender_port = args
            .next()
            .context("missing argument <udp_port>")?
            .parse()
            .context("invalid <udp_port>")?;
        let broadcast_port = args
            .next()
            .context("missing argument <broadcast_port>")?
            .parse()
            .context("invalid <broadcast_port>")?;
        let tcp_port = args
            .next()
            .context("missing argument <tcp_port>")?
            .parse()
            .context("invalid <tcp_port>")?;
        let simulate_drops = match args.next().as_deref() {
            None | Some("0") => false,
            Some("1") => true,
            Some(other) => anyhow::bail!("invalid [simulate_drops] value: {other}"),
        };
        if args.next().is_some() {
            anyhow::bail!("too many arguments");
        }
        Ok(Self {
            node_id,
            sender_port,
            broadcast_port,
            tcp_port,
            simulate_drops,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("cairnd: {e}\n{USAGE}");
            std::process::exit(1);
        }
    };
    // Seed a config file on first run; a read-only home is not fatal.
    if let Err(e) = CairnConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "could not write default config");
    }
    let config = CairnConfig::load().context("failed to load configuration")?;

    let span = tracing::info_span!("node", id = args.node_id);
    run(args, config).instrument(span).await
}

async fn run(args: Args, config: CairnConfig) -> Result<()> {
    tracing::info!(
        udp_port = args.sender_port,
        broadcast_port = args.broadcast_port,
        tcp_port = args.tcp_port,
        simulate_drops = args.simulate_drops,
        "cairnd starting"
    );

    std::fs::create_dir_all(&config.transfer.download_dir).with_context(|| {
        format!(
            "failed to create download directory {}",
            config.transfer.download_dir.display()
        )
    })?;

    let catalog = LocalCatalog::new();
    let registry = PeerRegistry::new();
    let cancel = CancellationToken::new();

    // Bind everything before spawning anything, so a port clash or
    // permission problem is a startup error with exit code 1, not a log
    // line from a half-started daemon.
    let broadcast_socket = announce::broadcast::bind(args.sender_port)
        .context("failed to set up the announcement broadcast socket")?;
    let listener_socket = announce::listener::bind(args.broadcast_port)
        .context("failed to set up the announcement listener socket")?;
    let drop_frequency = args
        .simulate_drops
        .then_some(config.transfer.drop_frequency);
    let server = transfer::TransferServer::bind(
        catalog.clone(),
        args.tcp_port,
        config.network.accept_backlog,
        drop_frequency,
    )
    .context("failed to set up the transfer server")?;

    let dest = SocketAddrV4::new(config.network.broadcast_addr, args.broadcast_port);
    let mut components = JoinSet::new();
    components.spawn(log_exit(
        "announcement broadcast",
        announce::broadcast::broadcast_loop(
            catalog.clone(),
            args.node_id,
            broadcast_socket,
            dest,
            config.network.announce_interval(),
            cancel.clone(),
        ),
    ));
    components.spawn(log_exit(
        "announcement listener",
        announce::listener::listener_loop(
            registry.clone(),
            args.node_id,
            listener_socket,
            cancel.clone(),
        ),
    ));
    components.spawn(log_exit(
        "staleness reaper",
        announce::listener::reaper_loop(
            registry.clone(),
            config.network.peer_ttl(),
            config.network.reap_interval(),
            cancel.clone(),
        ),
    ));
    components.spawn(log_exit("transfer server", server.serve(cancel.clone())));

    shutdown_signal().await?;
    tracing::info!("shutdown requested");
    cancel.cancel();
    while components.join_next().await.is_some() {}
    tracing::info!("cairnd stopped");
    Ok(())
}

async fn log_exit(component: &'static str, task: impl std::future::Future<Output = Result<()>>) {
    if let Err(e) = task.await {
        tracing::error!(component, error = %e, "component failed");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for ctrl-c")?;
    }
    Ok(())
}
