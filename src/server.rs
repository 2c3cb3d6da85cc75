//! Per-process run entries.
//!
//! A worker process serves WebSocket clients on its namespaced endpoint
//! and hosts the RPC server side of every configured transport layer. A
//! master process serves the bare endpoint as a round-robin proxy to the
//! workers and hosts the forwarder side of the RPC plane.

use crate::bind::BindAddress;
use crate::error::FabricError;
use crate::handler::handle_connection;
use crate::middleware::MiddlewareStack;
use crate::orchestrator::WorkerRegistry;
use crate::proxy::{bridge_client, RoundRobin};
use crate::settings::Settings;
use crate::transport::{TransportLayer, TransportLayers, TransportRole};
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tracing::info;

/// A bound client-facing listener of either address family.
pub enum FabricListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl FabricListener {
    pub async fn bind(address: &BindAddress) -> Result<Self, FabricError> {
        match address {
            BindAddress::Unix { path } => {
                // A stale socket from a previous run would fail the bind.
                let _ = std::fs::remove_file(path);
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
            BindAddress::Inet { .. } => {
                Ok(Self::Tcp(TcpListener::bind(address.authority()).await?))
            }
        }
    }
}

/// Runs one worker process until shutdown: the WebSocket accept loop and
/// the RPC servers of every transport layer.
pub async fn run_worker(
    namespace: &str,
    bind: &BindAddress,
    settings: &Settings,
) -> Result<(), FabricError> {
    let layers = Arc::new(TransportLayers::from_settings(
        settings,
        TransportRole::Server,
        namespace,
        None,
    )?);
    let layer = layers.default_layer();
    let stack = Arc::new(settings.middleware_stack()?);

    let address = bind.namespaced(namespace);
    let listener = FabricListener::bind(&address).await?;
    info!("{namespace} serving websockets at {address}");

    tokio::select! {
        result = serve_clients(listener, stack, layer) => result,
        result = layers.run_all() => result,
    }
}

async fn serve_clients(
    listener: FabricListener,
    stack: Arc<MiddlewareStack>,
    layer: Arc<TransportLayer>,
) -> Result<(), FabricError> {
    match listener {
        FabricListener::Tcp(listener) => loop {
            let (stream, _) = listener.accept().await?;
            tokio::spawn(handle_connection(
                stream,
                Arc::clone(&stack),
                Arc::clone(&layer),
            ));
        },
        FabricListener::Unix(listener) => loop {
            let (stream, _) = listener.accept().await?;
            tokio::spawn(handle_connection(
                stream,
                Arc::clone(&stack),
                Arc::clone(&layer),
            ));
        },
    }
}

/// Runs the master process until shutdown: the client-facing proxy and
/// the forwarder side of the RPC plane.
pub async fn run_master(
    bind: &BindAddress,
    settings: &Settings,
    registry: WorkerRegistry,
) -> Result<(), FabricError> {
    let layers = Arc::new(TransportLayers::from_settings(
        settings,
        TransportRole::Forwarder,
        "master",
        Some(registry.clone()),
    )?);

    let listener = FabricListener::bind(bind).await?;
    info!("master serving websockets at {bind}");

    let bind = bind.clone();
    tokio::select! {
        result = serve_proxy(listener, bind, registry) => result,
        result = layers.run_all() => result,
    }
}

async fn serve_proxy(
    listener: FabricListener,
    bind: BindAddress,
    registry: WorkerRegistry,
) -> Result<(), FabricError> {
    let balancer = Arc::new(RoundRobin::new());
    let bind = Arc::new(bind);
    let registry = Arc::new(registry);
    match listener {
        FabricListener::Tcp(listener) => loop {
            let (stream, _) = listener.accept().await?;
            let bind = Arc::clone(&bind);
            let registry = Arc::clone(&registry);
            let balancer = Arc::clone(&balancer);
            tokio::spawn(async move {
                bridge_client(stream, &bind, &registry, &balancer).await;
            });
        },
        FabricListener::Unix(listener) => loop {
            let (stream, _) = listener.accept().await?;
            let bind = Arc::clone(&bind);
            let registry = Arc::clone(&registry);
            let balancer = Arc::clone(&balancer);
            tokio::spawn(async move {
                bridge_client(stream, &bind, &registry, &balancer).await;
            });
        },
    }
}
