//! # Consumer Runtime
//!
//! A consumer is the per-connection object that owns a client socket,
//! listens on any number of group queues, and dispatches typed group
//! messages to handler methods while servicing client traffic.
//!
//! ## Task Structure
//!
//! While a connection is active the runtime drives two concurrent loops:
//!
//! - the **socket pump**, which polls the client socket with a short
//!   timeout so it stays responsive to the closing flag, and feeds every
//!   inbound frame to [`Consumer::receive`];
//! - the **group pump**, a spawned task that snapshots the current
//!   subscriptions, polls every subscription queue in parallel, and
//!   dispatches each arrived message through the consumer's handler
//!   table.
//!
//! Handler failures are logged and absorbed; only the
//! [`FabricError::Stop`] sentinel, a closed socket, or a failed
//! `connect` end the connection. Teardown unwinds every subscription
//! (both the consumer side and the backend side) before the runtime
//! returns.
//!
//! ## Dispatch
//!
//! Group messages carry a `kind` naming the handler to run. Handlers are
//! registered in a [`HandlerTable`] built at consumer construction;
//! lookup is case sensitive and a missing kind drops the message with a
//! warning.

use crate::error::FabricError;
use crate::groups::{
    GroupMessage, GroupSubscriber, QueueId, StopHandle, SubscriberQueue,
};
use crate::middleware::{ConnectionOutcome, Scope};
use crate::transport::TransportLayer;
use async_trait::async_trait;
use futures::future::join_all;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{Error as WsProtocolError, Message};
use tracing::{debug, error, warn};

/// Boxed write half of a client socket.
pub type WsSink =
    Pin<Box<dyn Sink<Message, Error = WsProtocolError> + Send + Sync>>;

/// Boxed read half of a client socket.
pub type WsSource = Pin<
    Box<dyn Stream<Item = Result<Message, WsProtocolError>> + Send + Sync>,
>;

/// One inbound client frame, already stripped of protocol control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketData {
    Text(String),
    Binary(Vec<u8>),
}

/// A per-connection application object.
///
/// `connect` runs once when the connection becomes active; an error there
/// closes the connection. `receive` runs for every client frame; its
/// errors are logged and the connection keeps serving. Group message
/// handlers are registered separately through [`Consumer::handlers`].
#[async_trait]
pub trait Consumer: Send + Sized + 'static {
    async fn connect(&mut self, ctx: &ConsumerContext) -> Result<(), FabricError>;

    async fn receive(
        &mut self,
        ctx: &ConsumerContext,
        data: SocketData,
    ) -> Result<(), FabricError>;

    /// The dispatch table mapping group message kinds to handlers.
    fn handlers() -> HandlerTable<Self> {
        HandlerTable::new()
    }
}

type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), FabricError>> + Send + 'a>>;

/// A registered group message handler.
pub type HandlerFn<C> =
    for<'a> fn(&'a mut C, &'a ConsumerContext, GroupMessage) -> HandlerFuture<'a>;

/// Dispatch table for group messages, keyed by message kind.
///
/// ```ignore
/// fn handlers() -> HandlerTable<Self> {
///     HandlerTable::new()
///         .on("chat", |c, ctx, msg| Box::pin(c.chat(ctx, msg)))
/// }
/// ```
pub struct HandlerTable<C> {
    entries: HashMap<&'static str, HandlerFn<C>>,
}

impl<C> HandlerTable<C> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn on(mut self, kind: &'static str, handler: HandlerFn<C>) -> Self {
        self.entries.insert(kind, handler);
        self
    }

    fn get(&self, kind: &str) -> Option<&HandlerFn<C>> {
        self.entries.get(kind)
    }
}

impl<C> Default for HandlerTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscription {
    queue_id: QueueId,
    queue: Arc<Mutex<mpsc::Receiver<GroupMessage>>>,
    on_stop: Option<StopHandle>,
}

/// Subscription bookkeeping for one connection, shared between the
/// consumer context, the group pump, and the group backend.
pub struct SubscriberState {
    closing: AtomicBool,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SubscriberState {
    pub fn new() -> Self {
        Self {
            closing: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn snapshot_queues(
        &self,
    ) -> Vec<(String, Arc<Mutex<mpsc::Receiver<GroupMessage>>>)> {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions
            .iter()
            .map(|(group, sub)| (group.clone(), Arc::clone(&sub.queue)))
            .collect()
    }

    /// Marks the connection as closing and unwinds every subscription.
    /// Idempotent; no new subscriptions are accepted once this has begun.
    async fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let groups: Vec<String> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions.keys().cloned().collect()
        };
        join_all(groups.iter().map(|group| self.stop_listening(group))).await;
    }
}

impl Default for SubscriberState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupSubscriber for SubscriberState {
    async fn listen(
        &self,
        group: &str,
        queue: SubscriberQueue,
        on_stop: StopHandle,
    ) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;
        if self.is_closing() {
            warn!("refusing to add a closing connection to group `{group}`");
            return false;
        }
        if let Some(existing) = subscriptions.get(group) {
            // Same queue offered twice is fine; a different queue means the
            // caller raced a second registration and must undo it.
            return existing.queue_id == queue.id;
        }
        subscriptions.insert(
            group.to_string(),
            Subscription {
                queue_id: queue.id,
                queue: Arc::new(Mutex::new(queue.receiver)),
                on_stop: Some(on_stop),
            },
        );
        true
    }

    async fn stop_listening(&self, group: &str) {
        let on_stop = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions
                .remove(group)
                .and_then(|subscription| subscription.on_stop)
        };
        if let Some(handle) = on_stop {
            if timeout(crate::defaults::STOP_DEADLINE, handle.invoke())
                .await
                .is_err()
            {
                warn!("timed out deregistering from group `{group}`");
            }
        }
    }
}

/// Handle a consumer uses to talk back to the fabric: send frames to its
/// client, join and leave groups, publish, and request a clean close.
#[derive(Clone)]
pub struct ConsumerContext {
    pub scope: Scope,
    sink: Arc<Mutex<WsSink>>,
    state: Arc<SubscriberState>,
    layer: Arc<TransportLayer>,
}

impl ConsumerContext {
    pub fn new(
        scope: Scope,
        sink: Arc<Mutex<WsSink>>,
        state: Arc<SubscriberState>,
        layer: Arc<TransportLayer>,
    ) -> Self {
        Self {
            scope,
            sink,
            state,
            layer,
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), FabricError> {
        self.send(Message::Text(text.into())).await
    }

    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), FabricError> {
        self.send(Message::Binary(data.into())).await
    }

    async fn send(&self, message: Message) -> Result<(), FabricError> {
        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|_| FabricError::ConnectionClosed)
    }

    /// Subscribes this connection to `group`.
    pub async fn group_add(&self, group: &str) -> Result<(), FabricError> {
        self.layer.group_add(group, self.state.as_ref()).await
    }

    /// Drops this connection's subscription to `group`.
    pub async fn group_discard(&self, group: &str) -> Result<(), FabricError> {
        self.layer.group_discard(group, self.state.as_ref()).await
    }

    /// Publishes `message` to `group` through the transport layer.
    /// Returns whether delivery was acknowledged.
    pub async fn group_send(
        &self,
        group: &str,
        message: GroupMessage,
    ) -> Result<bool, FabricError> {
        self.layer.group_send(group, message).await
    }

    /// Unwinds every subscription and returns the stop sentinel for the
    /// caller to propagate:
    ///
    /// ```ignore
    /// return Err(ctx.close().await);
    /// ```
    pub async fn close(&self) -> FabricError {
        self.state.begin_close().await;
        FabricError::Stop
    }
}

/// Drives one consumer over one client socket until the connection ends.
///
/// Returns the outcome the connection handler should act on: `Stop` when
/// the consumer asked for a clean close, `Continue` when the socket
/// simply went away.
pub async fn run_consumer<C: Consumer>(
    consumer: C,
    handlers: HandlerTable<C>,
    ctx: ConsumerContext,
    source: WsSource,
) -> ConnectionOutcome {
    let consumer = Arc::new(Mutex::new(consumer));
    let handlers = Arc::new(handlers);

    let pump = tokio::spawn(group_pump(
        Arc::clone(&consumer),
        Arc::clone(&handlers),
        ctx.clone(),
    ));

    let connected = {
        let mut consumer = consumer.lock().await;
        consumer.connect(&ctx).await
    };
    let outcome = match connected {
        Ok(()) => socket_pump(&consumer, &ctx, source).await,
        Err(FabricError::Stop) => ConnectionOutcome::Stop,
        Err(err) => {
            // A failed connect closes the consumer before it served anything.
            error!("consumer connect failed: {err}");
            ConnectionOutcome::Stop
        }
    };

    ctx.state.begin_close().await;
    pump.abort();
    let _ = pump.await;
    outcome
}

async fn socket_pump<C: Consumer>(
    consumer: &Arc<Mutex<C>>,
    ctx: &ConsumerContext,
    mut source: WsSource,
) -> ConnectionOutcome {
    while !ctx.state.is_closing() {
        let frame = match timeout(crate::defaults::SOCKET_POLL, source.next()).await {
            // Timed out waiting; re-check the closing flag and keep going.
            Err(_) => continue,
            Ok(None) => return ConnectionOutcome::Continue,
            Ok(Some(Err(err))) => {
                debug!("client socket closed: {err}");
                return ConnectionOutcome::Continue;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let data = match frame {
            Message::Text(text) => SocketData::Text(text),
            Message::Binary(data) => SocketData::Binary(data),
            Message::Close(_) => return ConnectionOutcome::Continue,
            // Ping/pong and raw frames are protocol plumbing.
            _ => continue,
        };

        let received = {
            let mut consumer = consumer.lock().await;
            consumer.receive(ctx, data).await
        };
        match received {
            Ok(()) => {}
            Err(FabricError::Stop) => return ConnectionOutcome::Stop,
            Err(err) => error!("unhandled error in receive: {err}"),
        }
    }
    ConnectionOutcome::Stop
}

async fn group_pump<C: Consumer>(
    consumer: Arc<Mutex<C>>,
    handlers: Arc<HandlerTable<C>>,
    ctx: ConsumerContext,
) {
    let state = Arc::clone(&ctx.state);
    let mut running: HashSet<String> = HashSet::new();

    while !state.is_closing() {
        let queues = state.snapshot_queues().await;
        for (group, _) in &queues {
            running.insert(group.clone());
        }

        if queues.is_empty() {
            sleep(crate::defaults::GROUP_IDLE_POLL).await;
            continue;
        }

        // Poll every subscription queue in parallel; queues that stay quiet
        // for the whole window simply contribute nothing this round.
        let polls = queues.iter().map(|(_, queue)| async move {
            let mut queue = queue.lock().await;
            match timeout(crate::defaults::QUEUE_POLL, queue.recv()).await {
                Ok(Some(message)) => Some(message),
                _ => None,
            }
        });
        let arrived: Vec<GroupMessage> =
            join_all(polls).await.into_iter().flatten().collect();

        for message in arrived {
            dispatch(&consumer, &handlers, &ctx, message).await;
        }

        // Groups discarded from outside since the snapshot no longer have a
        // subscription entry; finish tearing them down on this side too.
        let stale: Vec<String> = {
            let subscriptions = state.subscriptions.lock().await;
            running
                .iter()
                .filter(|group| !subscriptions.contains_key(*group))
                .cloned()
                .collect()
        };
        for group in stale {
            state.stop_listening(&group).await;
            running.remove(&group);
        }
    }
}

async fn dispatch<C: Consumer>(
    consumer: &Arc<Mutex<C>>,
    handlers: &HandlerTable<C>,
    ctx: &ConsumerContext,
    message: GroupMessage,
) {
    let Some(handler) = handlers.get(&message.kind) else {
        warn!(
            "no handler registered for group message kind `{}`, dropping it",
            message.kind
        );
        return;
    };
    let kind = message.kind.clone();
    let mut consumer = consumer.lock().await;
    match handler(&mut *consumer, ctx, message).await {
        Ok(()) => {}
        Err(FabricError::Stop) => {
            // The handler asked for a clean close; the closing flag is
            // already set and both pumps will wind down.
        }
        Err(err) => {
            error!("unhandled error in `{kind}` handler: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::GroupBackend;

    async fn subscribe(backend: &GroupBackend, state: &SubscriberState, group: &str) {
        backend.group_add(group, state).await.unwrap();
    }

    #[tokio::test]
    async fn listen_refuses_while_closing() {
        let backend = GroupBackend::new("t", 8);
        let state = SubscriberState::new();
        state.begin_close().await;

        backend.group_add("room", &state).await.unwrap();
        assert_eq!(backend.subscriber_count("room").await, 0);
        assert!(state.subscriptions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn listen_is_idempotent_per_group() {
        let backend = GroupBackend::new("t", 8);
        let state = SubscriberState::new();

        subscribe(&backend, &state, "room").await;
        subscribe(&backend, &state, "room").await;

        assert_eq!(backend.subscriber_count("room").await, 1);
        assert_eq!(state.subscriptions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn begin_close_unwinds_both_sides() {
        let backend = GroupBackend::new("t", 8);
        let state = SubscriberState::new();
        subscribe(&backend, &state, "room").await;
        subscribe(&backend, &state, "lobby").await;

        state.begin_close().await;

        assert_eq!(backend.subscriber_count("room").await, 0);
        assert_eq!(backend.subscriber_count("lobby").await, 0);
        assert!(state.subscriptions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn no_subscription_survives_a_second_close() {
        let backend = GroupBackend::new("t", 8);
        let state = SubscriberState::new();
        subscribe(&backend, &state, "room").await;

        state.begin_close().await;
        state.begin_close().await;
        assert!(state.subscriptions.lock().await.is_empty());
    }

    #[test]
    fn handler_table_lookup_is_case_sensitive() {
        struct Dummy;
        let table: HandlerTable<Dummy> = HandlerTable::new()
            .on("chat", |_c, _ctx, _m| {
                Box::pin(async { Ok::<(), FabricError>(()) })
            });
        assert!(table.get("chat").is_some());
        assert!(table.get("Chat").is_none());
        assert!(table.get("nosuch").is_none());
    }
}
