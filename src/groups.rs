//! # Per-Worker Group Registry
//!
//! A group is a named fan-out channel inside one worker process. The
//! backend maps each group to a set of bounded subscriber queues, one per
//! consumer that joined the group. Delivering a message to a group means
//! enqueueing it on every queue currently in the set.
//!
//! ## Concurrency Model
//!
//! A single backend mutex guards the group map. Snapshots of a group's
//! queue set are taken under the mutex and the actual enqueueing happens
//! outside it; the queues themselves are task-safe channels. Stop handles
//! are never invoked while the mutex is held, so a subscriber tearing
//! itself down cannot deadlock against a concurrent delivery.
//!
//! ## Delivery Semantics
//!
//! Best-effort, at most once per live subscriber queue. Queues are
//! bounded (`queue_depth` in the transport layer configuration); when a
//! queue is full the newest message is dropped for that subscriber and a
//! warning is emitted.

use crate::error::FabricError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Identifies one subscriber queue across the whole process.
pub type QueueId = u64;

/// A typed message published to a group.
///
/// `kind` names the handler method on the receiving consumer. `payload`
/// and `params` are opaque to the fabric and travel as bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub kind: String,
    pub payload: Vec<u8>,
    pub params: Option<Vec<u8>>,
}

impl GroupMessage {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: impl Into<Vec<u8>>) -> Self {
        self.params = Some(params.into());
        self
    }

    /// The payload as UTF-8 text, when it is text.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// The receiving end of one group subscription, handed to the subscriber
/// by [`GroupBackend::group_add`].
pub struct SubscriberQueue {
    pub(crate) id: QueueId,
    pub(crate) receiver: mpsc::Receiver<GroupMessage>,
}

impl SubscriberQueue {
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Waits for the next message. `None` once the group side is gone.
    pub async fn recv(&mut self) -> Option<GroupMessage> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`SubscriberQueue::recv`].
    pub fn try_recv(&mut self) -> Option<GroupMessage> {
        self.receiver.try_recv().ok()
    }
}

/// Undoes one queue registration.
///
/// Handed to the subscriber alongside the queue; invoking it removes the
/// queue from the group's set. Invocation is idempotent, and the removal
/// is unconditional: a queue never outlives the subscription that owns it.
#[derive(Clone)]
pub struct StopHandle {
    groups: Arc<Mutex<HashMap<String, Vec<GroupQueue>>>>,
    group: String,
    queue_id: QueueId,
}

impl StopHandle {
    pub async fn invoke(&self) {
        let mut groups = self.groups.lock().await;
        if let Some(queues) = groups.get_mut(&self.group) {
            queues.retain(|queue| queue.id != self.queue_id);
        }
    }
}

/// The subscriber half of the registration protocol.
///
/// Implemented by the consumer runtime; the backend only ever talks to
/// subscribers through this trait.
#[async_trait]
pub trait GroupSubscriber: Send + Sync {
    /// Offers a freshly registered queue to the subscriber.
    ///
    /// Returns `false` when the subscriber refuses it (it is closing, or
    /// the group is already bound to a different queue); the caller then
    /// invokes `on_stop` to undo the registration. Returns `true` when
    /// the queue was adopted, or when the same queue was already bound.
    async fn listen(
        &self,
        group: &str,
        queue: SubscriberQueue,
        on_stop: StopHandle,
    ) -> bool;

    /// Asks the subscriber to drop its subscription to `group`, invoking
    /// the stored stop handle.
    async fn stop_listening(&self, group: &str);
}

struct GroupQueue {
    id: QueueId,
    sender: mpsc::Sender<GroupMessage>,
}

/// In-memory pub/sub registry for one worker process.
pub struct GroupBackend {
    prefix: String,
    queue_depth: usize,
    groups: Arc<Mutex<HashMap<String, Vec<GroupQueue>>>>,
    next_queue_id: AtomicU64,
}

impl GroupBackend {
    pub fn new(prefix: impl Into<String>, queue_depth: usize) -> Self {
        Self {
            prefix: prefix.into(),
            queue_depth,
            groups: Arc::new(Mutex::new(HashMap::new())),
            next_queue_id: AtomicU64::new(1),
        }
    }

    /// Wraps a group name with the backend prefix to prevent collisions
    /// between layers sharing a process.
    fn scoped(&self, group: &str) -> String {
        format!("{}.__group.{}", self.prefix, group)
    }

    /// Creates the group if needed and subscribes `subscriber` to it.
    ///
    /// Idempotent per `(group, subscriber)` pair: the subscriber refuses
    /// a second queue for a group it already listens to, and the refused
    /// queue is unregistered on the spot.
    pub async fn group_add(
        &self,
        group: &str,
        subscriber: &dyn GroupSubscriber,
    ) -> Result<(), FabricError> {
        let group = self.scoped(group);
        let id = self.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_depth);

        {
            let mut groups = self.groups.lock().await;
            groups
                .entry(group.clone())
                .or_default()
                .push(GroupQueue { id, sender });
        }

        let on_stop = StopHandle {
            groups: Arc::clone(&self.groups),
            group: group.clone(),
            queue_id: id,
        };
        let adopted = subscriber
            .listen(&group, SubscriberQueue { id, receiver }, on_stop.clone())
            .await;
        if !adopted {
            on_stop.invoke().await;
        }
        Ok(())
    }

    /// Unsubscribes `subscriber` from `group`.
    ///
    /// The subscriber's stored stop handle removes the queue from the
    /// group set, so both sides of the subscription are gone when this
    /// returns.
    pub async fn group_discard(
        &self,
        group: &str,
        subscriber: &dyn GroupSubscriber,
    ) -> Result<(), FabricError> {
        let group = self.scoped(group);
        subscriber.stop_listening(&group).await;
        Ok(())
    }

    /// Enqueues `message` on every queue currently subscribed to `group`.
    ///
    /// Missing or empty groups are reported with a warning and otherwise
    /// ignored; a full queue drops the message for that subscriber only.
    pub async fn group_message(&self, group: &str, message: GroupMessage) {
        let scoped = self.scoped(group);
        let senders: Vec<(QueueId, mpsc::Sender<GroupMessage>)> = {
            let groups = self.groups.lock().await;
            match groups.get(&scoped) {
                None => {
                    warn!("sending a message to a nonexistent group `{group}`");
                    return;
                }
                Some(queues) if queues.is_empty() => {
                    warn!("group `{group}` has no listeners");
                    return;
                }
                Some(queues) => queues
                    .iter()
                    .map(|queue| (queue.id, queue.sender.clone()))
                    .collect(),
            }
        };

        for (id, sender) in senders {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "queue {id} in group `{group}` is full, dropping a \
                         `{}` message",
                        message.kind
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("queue {id} in group `{group}` is gone");
                }
            }
        }
    }

    /// Number of live queues in `group`. Diagnostics and tests only.
    pub async fn subscriber_count(&self, group: &str) -> usize {
        let groups = self.groups.lock().await;
        groups.get(&self.scoped(group)).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Minimal subscriber that adopts every queue offered to it.
    struct Adopter {
        closing: AtomicBool,
        subs: Mutex<HashMap<String, (QueueId, SubscriberQueue, StopHandle)>>,
    }

    impl Adopter {
        fn new() -> Self {
            Self {
                closing: AtomicBool::new(false),
                subs: Mutex::new(HashMap::new()),
            }
        }

        async fn recv(&self, group: &str) -> Option<GroupMessage> {
            let mut subs = self.subs.lock().await;
            let (_, queue, _) = subs.get_mut(group)?;
            queue.receiver.try_recv().ok()
        }
    }

    #[async_trait]
    impl GroupSubscriber for Adopter {
        async fn listen(
            &self,
            group: &str,
            queue: SubscriberQueue,
            on_stop: StopHandle,
        ) -> bool {
            let mut subs = self.subs.lock().await;
            if self.closing.load(Ordering::SeqCst) {
                return false;
            }
            if let Some((existing, _, _)) = subs.get(group) {
                return *existing == queue.id;
            }
            subs.insert(group.to_string(), (queue.id, queue, on_stop));
            true
        }

        async fn stop_listening(&self, group: &str) {
            let handle = {
                let mut subs = self.subs.lock().await;
                subs.remove(group).map(|(_, _, on_stop)| on_stop)
            };
            if let Some(handle) = handle {
                handle.invoke().await;
            }
        }
    }

    #[tokio::test]
    async fn add_then_discard_balances_out() {
        let backend = GroupBackend::new("test", 8);
        let sub = Adopter::new();

        backend.group_add("room", &sub).await.unwrap();
        assert_eq!(backend.subscriber_count("room").await, 1);

        backend.group_discard("room", &sub).await.unwrap();
        assert_eq!(backend.subscriber_count("room").await, 0);
    }

    #[tokio::test]
    async fn double_add_keeps_a_single_queue() {
        let backend = GroupBackend::new("test", 8);
        let sub = Adopter::new();

        backend.group_add("room", &sub).await.unwrap();
        backend.group_add("room", &sub).await.unwrap();
        assert_eq!(backend.subscriber_count("room").await, 1);
    }

    #[tokio::test]
    async fn refused_queue_is_unregistered() {
        let backend = GroupBackend::new("test", 8);
        let sub = Adopter::new();
        sub.closing.store(true, Ordering::SeqCst);

        backend.group_add("room", &sub).await.unwrap();
        assert_eq!(backend.subscriber_count("room").await, 0);
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let backend = GroupBackend::new("test", 8);
        let sub = Adopter::new();
        backend.group_add("room", &sub).await.unwrap();

        for i in 0..3u8 {
            backend
                .group_message("room", GroupMessage::new("chat", vec![i]))
                .await;
        }

        let scoped = backend.scoped("room");
        for i in 0..3u8 {
            let message = sub.recv(&scoped).await.expect("message should arrive");
            assert_eq!(message.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn full_queue_drops_the_newest() {
        let backend = GroupBackend::new("test", 2);
        let sub = Adopter::new();
        backend.group_add("room", &sub).await.unwrap();

        for i in 0..5u8 {
            backend
                .group_message("room", GroupMessage::new("chat", vec![i]))
                .await;
        }

        let scoped = backend.scoped("room");
        assert_eq!(sub.recv(&scoped).await.unwrap().payload, vec![0]);
        assert_eq!(sub.recv(&scoped).await.unwrap().payload, vec![1]);
        assert!(sub.recv(&scoped).await.is_none());
    }

    #[tokio::test]
    async fn empty_group_is_tolerated() {
        let backend = GroupBackend::new("test", 8);
        backend
            .group_message("ghost", GroupMessage::new("chat", b"x".to_vec()))
            .await;
    }

    #[tokio::test]
    async fn two_subscribers_both_receive() {
        let backend = GroupBackend::new("test", 8);
        let a = Adopter::new();
        let b = Adopter::new();
        backend.group_add("room", &a).await.unwrap();
        backend.group_add("room", &b).await.unwrap();

        backend
            .group_message("room", GroupMessage::new("chat", b"hi".to_vec()))
            .await;

        let scoped = backend.scoped("room");
        assert_eq!(a.recv(&scoped).await.unwrap().text(), Some("hi"));
        assert_eq!(b.recv(&scoped).await.unwrap().text(), Some("hi"));
    }
}
