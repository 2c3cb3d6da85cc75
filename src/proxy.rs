//! Master-side WebSocket proxy.
//!
//! The master binds the bare client-facing endpoint. Each accepted
//! connection is bridged to one worker, chosen round-robin from the
//! current worker snapshot, by dialing the worker's namespaced endpoint
//! with a forwarded subset of the client's request headers. The bridge
//! pumps frames in both directions until either side closes.

use crate::bind::BindAddress;
use crate::error::FabricError;
use crate::orchestrator::WorkerRegistry;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as ClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Headers copied from the client request onto the worker dial, plus any
/// `x-*` header.
const FORWARDED_HEADERS: &[&str] = &[
    "cookie",
    "user-agent",
    "origin",
    "accept-encoding",
    "accept-language",
];

/// Shared round-robin cursor over the worker snapshot.
#[derive(Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the next entry. The snapshot may differ between calls; the
    /// cursor only promises rotation, not a stable assignment.
    pub fn pick(&self, items: &[String]) -> Option<String> {
        if items.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(items[index % items.len()].clone())
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Bridges one client connection to a round-robin chosen worker.
pub async fn bridge_client<S>(
    stream: S,
    bind: &BindAddress,
    registry: &WorkerRegistry,
    balancer: &RoundRobin,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut path = String::from("/");
    let mut headers = HashMap::new();
    let callback = |request: &Request, response: Response| {
        path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        for (name, value) in request.headers() {
            headers.insert(
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            );
        }
        Ok(response)
    };

    let mut client = match tokio_tungstenite::accept_hdr_async(stream, callback).await
    {
        Ok(client) => client,
        Err(err) => {
            debug!("client handshake failed: {err}");
            return;
        }
    };

    let worker = match dial_worker(bind, registry, balancer, &path, &headers).await {
        Ok(worker) => worker,
        Err(err) => {
            warn!("could not reach a worker for `{path}`: {err}");
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            let _ = client.close(Some(frame)).await;
            return;
        }
    };

    let (mut to_client, mut from_client) = client.split();
    let (mut to_worker, mut from_worker) = worker.split();

    let upstream = async move {
        while let Some(Ok(frame)) = from_client.next().await {
            if to_worker.send(frame).await.is_err() {
                break;
            }
        }
    };
    let downstream = async move {
        while let Some(Ok(frame)) = from_worker.next().await {
            if to_client.send(frame).await.is_err() {
                break;
            }
        }
    };

    // Either direction ending (close or error) tears the bridge down;
    // dropping the halves closes both sockets.
    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }
}

async fn dial_worker(
    bind: &BindAddress,
    registry: &WorkerRegistry,
    balancer: &RoundRobin,
    path: &str,
    headers: &HashMap<String, String>,
) -> Result<WebSocketStream<Box<dyn Io>>, FabricError> {
    let workers = registry.snapshot();
    let namespace = balancer.pick(&workers).ok_or_else(|| {
        FabricError::TransportUnavailable("no live workers".into())
    })?;
    let address = bind.namespaced(&namespace);

    let request = forward_request(&address, path, headers)?;
    let stream: Box<dyn Io> = match &address {
        BindAddress::Inet { .. } => {
            Box::new(TcpStream::connect(address.authority()).await?)
        }
        BindAddress::Unix { path } => Box::new(UnixStream::connect(path).await?),
    };
    let (socket, _) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|err| FabricError::TransportUnavailable(err.to_string()))?;
    debug!("bridged `{path}` to {namespace}");
    Ok(socket)
}

/// Builds the worker-side handshake request, forwarding the allowlisted
/// client headers.
fn forward_request(
    address: &BindAddress,
    path: &str,
    headers: &HashMap<String, String>,
) -> Result<ClientRequest, FabricError> {
    let uri = match address {
        BindAddress::Inet { .. } => {
            format!("ws://{}{}", address.authority(), path)
        }
        // The authority is a placeholder; the frames travel over the
        // already connected unix stream.
        BindAddress::Unix { .. } => format!("ws://localhost:8080{path}"),
    };
    let mut request = uri
        .into_client_request()
        .map_err(|err| FabricError::TransportUnavailable(err.to_string()))?;

    for (name, value) in headers {
        let forwarded =
            FORWARDED_HEADERS.contains(&name.as_str()) || name.starts_with("x-");
        if !forwarded {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        request.headers_mut().insert(name, value);
    }

    Ok(request)
}
