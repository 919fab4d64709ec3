// MeshMind node daemon: catalog, LAN discovery and the transfer listener.

use std::sync::Arc;

use anyhow::Context;
use mesh_core::PeerId;
use mesh_node::catalog::{self, Catalog};
use mesh_node::{
    config, AddressBook, Coordinator, Discovery, GenerationClient, PeerEvent, TcpBearer,
    TcpConnector, UdpMulticast,
};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("mesh-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mesh_node=info,mesh_core=info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new().context("start runtime")?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let catalog = Arc::new(
        Catalog::open(&cfg.data_dir)
            .await
            .with_context(|| format!("open catalog in {}", cfg.data_dir.display()))?,
    );
    let local = match &cfg.peer_id {
        Some(id) => PeerId::new(id.clone()),
        None => PeerId::new(
            catalog
                .store()
                .load_or_create_peer_id()
                .await
                .context("load peer id")?,
        ),
    };
    tracing::info!(
        peer_id = %local,
        role = ?cfg.role,
        artifacts = catalog.len(),
        version = VERSION,
        "mesh-node starting"
    );

    let addresses = AddressBook::new();
    let backend = Arc::new(
        UdpMulticast::bind(cfg.discovery_port, local.clone(), addresses.clone())
            .await
            .with_context(|| format!("bind discovery port {}", cfg.discovery_port))?,
    );
    let bearer = TcpBearer::bind(cfg.transport_port)
        .await
        .with_context(|| format!("bind transport port {}", cfg.transport_port))?;

    let discovery = Discovery::new(local.clone(), cfg.discovery_config(), backend);
    let coordinator = Coordinator::new(
        catalog.clone(),
        discovery.peers(),
        TcpConnector::new(addresses),
        cfg.session_config(),
    );

    let maintenance = catalog::spawn_maintenance(catalog.clone(), cfg.sweep_interval());
    let server = tokio::spawn(coordinator.clone().serve(bearer));
    discovery.start_advertising(catalog.watch_summaries());
    drop(discovery.start_scanning());

    let mut peer_events = coordinator.subscribe_peers();
    let mut new_sessions = coordinator.subscribe_sessions();
    let monitor = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = peer_events.recv() => match event {
                    Ok(PeerEvent::Updated(peer)) => tracing::debug!(
                        peer_id = %peer.peer_id,
                        artifacts = peer.advertised.len(),
                        "peer updated"
                    ),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "peer events lagged")
                    }
                    Err(_) => return,
                },
                session = new_sessions.recv() => if let Ok(handle) = session {
                    tracing::info!(
                        session_id = %handle.id(),
                        peer_id = %handle.peer_id(),
                        artifact_id = %handle.artifact_id(),
                        direction = ?handle.direction(),
                        "session opened"
                    );
                },
            }
        }
    });

    match GenerationClient::new(cfg.generation_url.clone()) {
        Ok(client) => {
            let healthy = client.health().await;
            tracing::info!(url = %client.base_url(), healthy, "generation service");
        }
        Err(e) => tracing::warn!(error = %e, "generation client unavailable"),
    }

    shutdown_signal().await?;
    tracing::info!("shutting down");
    discovery.stop_advertising();
    discovery.stop_scanning();
    server.abort();
    maintenance.abort();
    monitor.abort();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for Ctrl+C")?;
    }
    Ok(())
}
