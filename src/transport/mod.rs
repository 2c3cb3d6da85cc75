//! # Transport Layer
//!
//! The transport layer is what application code talks to when it joins,
//! leaves, or publishes to a group. One layer exists per configured alias
//! per process (`default` is required), and each layer bridges the local
//! [`GroupBackend`] with the cross-process RPC plane according to its
//! role:
//!
//! - **Client**: a pure producer. `group_send` goes out as a
//!   `SendMessage` RPC to the configured address; no RPC server is
//!   hosted.
//! - **Server**: a worker. Hosts an RPC server on its namespaced
//!   endpoint; inbound `SendMessage` calls deliver straight to the local
//!   backend, while the worker's own `group_send` publishes to the
//!   forwarder so subscribers on every worker receive it.
//! - **Forwarder**: the master. Hosts an RPC server on the bare endpoint
//!   and re-dispatches every inbound `SendMessage` to each live worker.
//!
//! Group names are validated on every operation before any state is
//! touched: ASCII alphanumerics, hyphens, underscores, or periods,
//! non-empty and shorter than 100 characters.

pub mod proto;
pub mod rpc;

use crate::bind::BindAddress;
use crate::error::FabricError;
use crate::groups::{GroupBackend, GroupMessage, GroupSubscriber};
use crate::orchestrator::WorkerRegistry;
use crate::settings::Settings;
use futures::future::try_join_all;
use proto::ws_group_manager_client::WsGroupManagerClient;
use rpc::ForwarderState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::warn;

/// The role a transport layer plays in the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    /// Producer only; publishes by RPC to the configured address.
    Client,
    /// Worker; hosts a backend and an RPC server on its namespaced
    /// endpoint.
    Server,
    /// Master; fans every inbound publish out to the live workers.
    Forwarder,
}

/// Fully resolved per-layer configuration.
#[derive(Debug, Clone)]
pub struct LayerConfig {
    /// RPC endpoint of the plane (bare; workers derive their namespaced
    /// variant from it).
    pub address: BindAddress,
    /// Concurrency limit for the layer's RPC server.
    pub num_connections: usize,
    /// Backend namespace prefix; defaults to the alias.
    pub prefix: String,
    /// Depth of each subscriber queue. Overflow drops the newest message
    /// for that subscriber with a warning.
    pub queue_depth: usize,
}

/// One configured transport layer.
pub struct TransportLayer {
    alias: String,
    role: TransportRole,
    namespace: String,
    backend: GroupBackend,
    config: LayerConfig,
    client: Mutex<Option<WsGroupManagerClient<Channel>>>,
    forwarder: Option<ForwarderState>,
}

impl TransportLayer {
    pub(crate) fn new(
        alias: String,
        role: TransportRole,
        namespace: String,
        config: LayerConfig,
        registry: Option<WorkerRegistry>,
    ) -> Self {
        let backend = GroupBackend::new(config.prefix.clone(), config.queue_depth);
        let forwarder = match role {
            TransportRole::Forwarder => Some(ForwarderState::new(
                registry.expect("forwarder layers require a worker registry"),
                config.address.clone(),
            )),
            _ => None,
        };
        Self {
            alias,
            role,
            namespace,
            backend,
            config,
            client: Mutex::new(None),
            forwarder,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn role(&self) -> TransportRole {
        self.role
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    /// The layer's local group backend.
    pub fn backend(&self) -> &GroupBackend {
        &self.backend
    }

    /// Validates a group name against the accepted grammar without
    /// touching any state.
    pub fn valid_group_name(name: &str) -> Result<(), FabricError> {
        let well_formed = !name.is_empty()
            && name.len() < crate::defaults::GROUP_NAME_MAX
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if well_formed {
            Ok(())
        } else {
            Err(FabricError::InvalidGroupName(name.to_string()))
        }
    }

    /// Subscribes `subscriber` to `group` on the local backend.
    pub async fn group_add(
        &self,
        group: &str,
        subscriber: &dyn GroupSubscriber,
    ) -> Result<(), FabricError> {
        Self::valid_group_name(group)?;
        self.backend.group_add(group, subscriber).await
    }

    /// Removes `subscriber` from `group` on the local backend.
    pub async fn group_discard(
        &self,
        group: &str,
        subscriber: &dyn GroupSubscriber,
    ) -> Result<(), FabricError> {
        self.backend.group_discard(group, subscriber).await
    }

    /// Publishes `message` to `group` across the whole fabric.
    ///
    /// Producers (client and server roles alike) hand the message to the
    /// forwarder at the configured address, which fans it out to every
    /// live worker; subscribers on the publishing worker receive their
    /// copy through the same fan-out. The forwarder itself dispatches
    /// straight to the workers.
    ///
    /// Delivery is best-effort. The returned `bool` is the acknowledgment
    /// from the plane; `false` means the channel was unavailable or the
    /// remote end declined.
    pub async fn group_send(
        &self,
        group: &str,
        message: GroupMessage,
    ) -> Result<bool, FabricError> {
        Self::valid_group_name(group)?;
        match self.role {
            TransportRole::Client | TransportRole::Server => {
                Ok(self.send_remote(group, message).await)
            }
            TransportRole::Forwarder => {
                let forwarder = self
                    .forwarder
                    .as_ref()
                    .expect("forwarder role always carries forwarder state");
                Ok(forwarder.fan_out(group, message).await)
            }
        }
    }

    /// Delivers one inbound publish the way the RPC plane does: straight
    /// into the local backend on a worker, and out to every live worker
    /// on the forwarder. No further RPC hop happens on a worker, so the
    /// plane cannot loop.
    pub async fn deliver(
        &self,
        group: &str,
        message: GroupMessage,
    ) -> Result<bool, FabricError> {
        Self::valid_group_name(group)?;
        match self.role {
            TransportRole::Client | TransportRole::Server => {
                self.backend.group_message(group, message).await;
                Ok(true)
            }
            TransportRole::Forwarder => {
                let forwarder = self
                    .forwarder
                    .as_ref()
                    .expect("forwarder role always carries forwarder state");
                Ok(forwarder.fan_out(group, message).await)
            }
        }
    }

    /// Issues `SendMessage` over the lazily opened client channel.
    async fn send_remote(&self, group: &str, message: GroupMessage) -> bool {
        let mut stub = match self.client_stub().await {
            Ok(stub) => stub,
            Err(err) => {
                warn!("transport unavailable for `{}`: {err}", self.alias);
                return false;
            }
        };
        let request = proto::WsSendMessageRequest {
            group: group.to_string(),
            message: Some(message.into()),
        };
        match stub.send_message(request).await {
            Ok(response) => response.into_inner().ack,
            Err(status) => {
                warn!("group send over `{}` failed: {status}", self.alias);
                // Drop the channel; the next send rebuilds it.
                self.client.lock().await.take();
                false
            }
        }
    }

    async fn client_stub(
        &self,
    ) -> Result<WsGroupManagerClient<Channel>, FabricError> {
        let mut client = self.client.lock().await;
        if client.is_none() {
            let channel = rpc::connect_channel(&self.config.address)
                .await
                .map_err(|err| {
                    FabricError::TransportUnavailable(err.to_string())
                })?;
            *client = Some(WsGroupManagerClient::new(channel));
        }
        Ok(client.as_ref().expect("populated above").clone())
    }

    /// Runs the layer's server side. Called once the orchestrator has
    /// transitioned the owning process into its role; a no-op for client
    /// layers.
    pub async fn run(self: &Arc<Self>) -> Result<(), FabricError> {
        match self.role {
            TransportRole::Client => Ok(()),
            TransportRole::Server => {
                let address = self.config.address.namespaced(&self.namespace);
                rpc::serve(Arc::clone(self), address, self.config.num_connections)
                    .await
            }
            TransportRole::Forwarder => {
                let address = self.config.address.clone();
                rpc::serve(Arc::clone(self), address, self.config.num_connections)
                    .await
            }
        }
    }
}

/// The per-process set of transport layers, keyed by alias.
pub struct TransportLayers {
    layers: HashMap<String, Arc<TransportLayer>>,
}

impl TransportLayers {
    /// Builds every configured layer for a process of the given role and
    /// namespace. Forwarder processes must supply the worker registry.
    pub fn from_settings(
        settings: &Settings,
        role: TransportRole,
        namespace: &str,
        registry: Option<WorkerRegistry>,
    ) -> Result<Self, FabricError> {
        let mut layers = HashMap::new();
        for (alias, backend_config) in settings.transport_backends() {
            let config = backend_config.resolve(alias)?;
            let layer = TransportLayer::new(
                alias.clone(),
                role,
                namespace.to_string(),
                config,
                registry.clone(),
            );
            layers.insert(alias.clone(), Arc::new(layer));
        }
        if !layers.contains_key("default") {
            return Err(FabricError::NotConfigured(
                "transport backends must include a `default` alias".into(),
            ));
        }
        Ok(Self { layers })
    }

    pub fn get(&self, alias: &str) -> Option<&Arc<TransportLayer>> {
        self.layers.get(alias)
    }

    /// The `default` layer. Present by construction.
    pub fn default_layer(&self) -> Arc<TransportLayer> {
        Arc::clone(&self.layers["default"])
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    /// Runs the server side of every layer until shutdown.
    pub async fn run_all(&self) -> Result<(), FabricError> {
        try_join_all(self.layers.values().map(|layer| layer.run())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_grammar() {
        for name in ["room", "room.1", "a-b_c.d", "R00M"] {
            assert!(TransportLayer::valid_group_name(name).is_ok());
        }
        let too_long = "x".repeat(100);
        for name in ["", "room!", "room name", "rüm", too_long.as_str()] {
            assert!(TransportLayer::valid_group_name(name).is_err());
        }
        let longest = "x".repeat(99);
        assert!(TransportLayer::valid_group_name(&longest).is_ok());
    }
}
