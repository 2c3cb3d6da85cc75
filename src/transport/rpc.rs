//! gRPC plumbing for the transport layer: channel construction over unix
//! and inet endpoints, the `WSGroupManager` service implementation, and
//! the forwarder's per-worker fan-out.

use super::proto::ws_group_manager_client::WsGroupManagerClient;
use super::proto::ws_group_manager_server::{WsGroupManager, WsGroupManagerServer};
use super::proto::{WsMessage, WsResponse, WsSendMessageRequest};
use super::TransportLayer;
use crate::bind::BindAddress;
use crate::error::FabricError;
use crate::groups::GroupMessage;
use crate::orchestrator::WorkerRegistry;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

impl From<WsMessage> for GroupMessage {
    fn from(message: WsMessage) -> Self {
        GroupMessage {
            kind: message.r#type,
            payload: message.message,
            params: message.params,
        }
    }
}

impl From<GroupMessage> for WsMessage {
    fn from(message: GroupMessage) -> Self {
        WsMessage {
            r#type: message.kind,
            message: message.payload,
            params: message.params,
        }
    }
}

/// Opens a gRPC channel to `address`.
pub(crate) async fn connect_channel(
    address: &BindAddress,
) -> Result<Channel, tonic::transport::Error> {
    match address {
        BindAddress::Inet { .. } => {
            Endpoint::new(format!("http://{}", address.authority()))?
                .connect()
                .await
        }
        BindAddress::Unix { path } => {
            let path = path.clone();
            // The URI is required but ignored for unix channels.
            Endpoint::from_static("http://localhost")
                .connect_with_connector(tower::service_fn(move |_| {
                    let path = path.clone();
                    async move {
                        UnixStream::connect(path).await.map(TokioIo::new)
                    }
                }))
                .await
        }
    }
}

/// `WSGroupManager` service backed by one transport layer.
///
/// On a worker the layer delivers inbound messages to the local backend;
/// on the master the layer re-dispatches them to every live worker.
struct GroupManagerService {
    layer: Arc<TransportLayer>,
}

#[tonic::async_trait]
impl WsGroupManager for GroupManagerService {
    async fn send_message(
        &self,
        request: Request<WsSendMessageRequest>,
    ) -> Result<Response<WsResponse>, Status> {
        let request = request.into_inner();
        let Some(message) = request.message else {
            warn!("SendMessage for group `{}` had no message", request.group);
            return Ok(Response::new(WsResponse { ack: false }));
        };
        let ack = match self
            .layer
            .deliver(&request.group, message.into())
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                warn!("inbound group send failed: {err}");
                false
            }
        };
        Ok(Response::new(WsResponse { ack }))
    }
}

/// Serves the `WSGroupManager` service for `layer` on `address` until
/// shutdown.
pub(crate) async fn serve(
    layer: Arc<TransportLayer>,
    address: BindAddress,
    concurrency: usize,
) -> Result<(), FabricError> {
    let service = WsGroupManagerServer::new(GroupManagerService { layer });
    let mut builder = Server::builder().concurrency_limit_per_connection(concurrency);
    info!("rpc plane listening at {address}");
    let served = match &address {
        BindAddress::Unix { path } => {
            // A stale socket from a previous run would fail the bind.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            builder
                .add_service(service)
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
        }
        BindAddress::Inet { .. } => {
            let listener = TcpListener::bind(address.authority()).await?;
            builder
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
        }
    };
    served.map_err(|err| FabricError::TransportUnavailable(err.to_string()))
}

/// Fan-out state of the master's forwarder layer: the shared worker list
/// plus one lazily built client stub per worker namespace.
pub(crate) struct ForwarderState {
    registry: WorkerRegistry,
    address: BindAddress,
    stubs: Mutex<HashMap<String, WsGroupManagerClient<Channel>>>,
}

impl ForwarderState {
    pub(crate) fn new(registry: WorkerRegistry, address: BindAddress) -> Self {
        Self {
            registry,
            address,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    /// Re-dispatches one publish to every worker in the current snapshot
    /// of the shared list.
    ///
    /// Per-worker failures are logged and the offending stub dropped for
    /// rebuild on the next pass; they never abort the fan-out. The
    /// aggregate acknowledgment is `true` iff at least one delivery was
    /// attempted.
    pub(crate) async fn fan_out(&self, group: &str, message: GroupMessage) -> bool {
        let workers = self.registry.snapshot();
        if workers.is_empty() {
            warn!("no live workers to fan group `{group}` out to");
            return false;
        }

        let mut attempted = false;
        for namespace in workers {
            let mut stub = match self.stub_for(&namespace).await {
                Ok(stub) => stub,
                Err(err) => {
                    warn!("worker `{namespace}` unreachable: {err}");
                    continue;
                }
            };
            attempted = true;
            let request = WsSendMessageRequest {
                group: group.to_string(),
                message: Some(message.clone().into()),
            };
            if let Err(status) = stub.send_message(request).await {
                warn!("fan-out to `{namespace}` failed: {status}");
                // The endpoint is address-stable across worker restarts, but
                // a stub whose channel died must be rebuilt on next use.
                self.stubs.lock().await.remove(&namespace);
            }
        }
        attempted
    }

    async fn stub_for(
        &self,
        namespace: &str,
    ) -> Result<WsGroupManagerClient<Channel>, tonic::transport::Error> {
        if let Some(stub) = self.stubs.lock().await.get(namespace) {
            return Ok(stub.clone());
        }
        let address = self.address.namespaced(namespace);
        let channel = connect_channel(&address).await?;
        let stub = WsGroupManagerClient::new(channel);
        self.stubs
            .lock()
            .await
            .insert(namespace.to_string(), stub.clone());
        Ok(stub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_round_trip() {
        let message = GroupMessage::new("chat", b"hi".to_vec())
            .with_params(b"{}".to_vec());
        let wire: WsMessage = message.clone().into();
        assert_eq!(wire.r#type, "chat");
        assert_eq!(GroupMessage::from(wire), message);
    }

    #[test]
    fn absent_params_stay_absent() {
        let wire: WsMessage = GroupMessage::new("chat", b"hi".to_vec()).into();
        assert_eq!(wire.params, None);
    }
}
