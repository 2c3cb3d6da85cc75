//! # WebSocket Fan-Out Fabric
//!
//! A horizontally scalable WebSocket serving fabric: a master process and
//! any number of worker processes share a logical pub/sub space of named
//! groups, and a gRPC forwarding plane carries `group_send` calls from
//! any producer through the master to every live worker.
//!
//! The wire protocol itself is delegated to `tokio-tungstenite`; the
//! engineering here is the fabric around it:
//!
//! 1. **Orchestrator**: supervises the master and workers, restarts
//!    whatever exits, and maintains the shared worker list.
//! 2. **Forwarding plane**: the master accepts `SendMessage` RPCs from
//!    any producer and fans them out by unicast RPC to each worker.
//! 3. **Group backend**: a per-worker registry mapping group names to
//!    sets of bounded subscriber queues.
//! 4. **Consumer runtime**: the per-connection state machine that
//!    multiplexes client traffic with group deliveries and dispatches
//!    typed messages to registered handlers.

pub mod bind;
pub mod cli;
pub mod consumer;
pub mod error;
pub mod groups;
pub mod handler;
pub mod logging;
pub mod middleware;
pub mod orchestrator;
pub mod proxy;
pub mod server;
pub mod settings;
pub mod transport;

pub use bind::BindAddress;
pub use consumer::{Consumer, ConsumerContext, HandlerTable, SocketData};
pub use error::FabricError;
pub use groups::{GroupBackend, GroupMessage};
pub use handler::as_consumer;
pub use middleware::{ConnectionOutcome, Middleware, Router, Scope};
pub use orchestrator::{Orchestrator, WorkerRegistry};
pub use settings::Settings;
pub use transport::{TransportLayer, TransportLayers, TransportRole};

/// The current version of the fabric.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values and protocol timing constants.
pub mod defaults {
    use std::time::Duration;

    /// Default RPC plane endpoint.
    pub const RPC_ADDRESS: &str = "unix:/tmp/rpc.socket";

    /// Default per-connection concurrency limit of an RPC server.
    pub const NUM_CONNECTIONS: usize = 20;

    /// Default bound of one subscriber queue. Overflow drops the newest
    /// message for that subscriber with a warning.
    pub const QUEUE_DEPTH: usize = 32;

    /// Group names must be shorter than this.
    pub const GROUP_NAME_MAX: usize = 100;

    /// How long the socket pump waits for a client frame before it
    /// re-checks the closing flag.
    pub const SOCKET_POLL: Duration = Duration::from_millis(100);

    /// How long the group pump sleeps when the consumer has no
    /// subscriptions.
    pub const GROUP_IDLE_POLL: Duration = Duration::from_millis(100);

    /// How long one group pump round waits on each subscription queue.
    pub const QUEUE_POLL: Duration = Duration::from_secs(1);

    /// Deadline for a subscription's stop callback.
    pub const STOP_DEADLINE: Duration = Duration::from_secs(1);

    /// Idle interval of the orchestrator's supervision loop.
    pub const SUPERVISION_TICK: Duration = Duration::from_secs(2);

    /// How long the orchestrator waits for a spawned process to bind its
    /// endpoint before giving up on publishing it.
    pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

    /// How long shutdown waits for children to exit before SIGKILL.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
}
