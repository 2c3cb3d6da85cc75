//! Fan-out behavior of the forwarding plane, driven at the transport
//! layer level: real tonic servers on temp-dir unix sockets, no
//! WebSocket in sight.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use ws_fabric::bind::BindAddress;
use ws_fabric::error::FabricError;
use ws_fabric::groups::{GroupMessage, GroupSubscriber, StopHandle, SubscriberQueue};
use ws_fabric::orchestrator::{await_endpoint, WorkerRegistry};
use ws_fabric::settings::Settings;
use ws_fabric::transport::{TransportLayer, TransportLayers, TransportRole};

const READY: Duration = Duration::from_secs(5);

/// Single-subscription adopter used to observe deliveries.
struct Adopter {
    queue: Mutex<Option<SubscriberQueue>>,
    on_stop: Mutex<Option<StopHandle>>,
}

impl Adopter {
    fn new() -> Self {
        Self {
            queue: Mutex::new(None),
            on_stop: Mutex::new(None),
        }
    }

    async fn recv(&self, within: Duration) -> Option<GroupMessage> {
        let mut slot = self.queue.lock().await;
        let queue = slot.as_mut()?;
        timeout(within, queue.recv()).await.ok().flatten()
    }
}

#[async_trait]
impl GroupSubscriber for Adopter {
    async fn listen(
        &self,
        _group: &str,
        queue: SubscriberQueue,
        on_stop: StopHandle,
    ) -> bool {
        let mut slot = self.queue.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(queue);
        *self.on_stop.lock().await = Some(on_stop);
        true
    }

    async fn stop_listening(&self, _group: &str) {
        self.queue.lock().await.take();
        if let Some(handle) = self.on_stop.lock().await.take() {
            handle.invoke().await;
        }
    }
}

struct Plane {
    forwarder: Arc<TransportLayer>,
    workers: Vec<Arc<TransportLayer>>,
    registry: WorkerRegistry,
    settings: Settings,
}

async fn start_plane(dir: &Path, worker_names: &[&str]) -> Plane {
    let rpc =
        BindAddress::parse(&format!("unix:{}/rpc.socket", dir.display())).unwrap();
    let settings = Settings::single_backend(&rpc);

    let registry = WorkerRegistry::new(dir.join("workers"));
    let names: Vec<String> = worker_names.iter().map(|s| s.to_string()).collect();
    registry.publish(&names).unwrap();

    let mut workers = Vec::new();
    for name in worker_names {
        let layers =
            TransportLayers::from_settings(&settings, TransportRole::Server, name, None)
                .unwrap();
        let layer = layers.default_layer();
        let serving = Arc::clone(&layer);
        tokio::spawn(async move { serving.run().await.unwrap() });
        assert!(await_endpoint(&rpc.namespaced(name), READY).await);
        workers.push(layer);
    }

    let layers = TransportLayers::from_settings(
        &settings,
        TransportRole::Forwarder,
        "master",
        Some(registry.clone()),
    )
    .unwrap();
    let forwarder = layers.default_layer();
    let serving = Arc::clone(&forwarder);
    tokio::spawn(async move { serving.run().await.unwrap() });
    assert!(await_endpoint(&rpc, READY).await);

    Plane {
        forwarder,
        workers,
        registry,
        settings,
    }
}

fn client_layer(plane: &Plane) -> Arc<TransportLayer> {
    TransportLayers::from_settings(
        &plane.settings,
        TransportRole::Client,
        "",
        None,
    )
    .unwrap()
    .default_layer()
}

#[tokio::test]
async fn fan_out_reaches_every_worker_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let plane = start_plane(dir.path(), &["worker_0", "worker_1"]).await;

    let a0 = Adopter::new();
    let a1 = Adopter::new();
    plane.workers[0].group_add("room", &a0).await.unwrap();
    plane.workers[1].group_add("room", &a1).await.unwrap();

    let producer = client_layer(&plane);
    let ack = producer
        .group_send("room", GroupMessage::new("chat", b"hi".to_vec()))
        .await
        .unwrap();
    assert!(ack);

    let m0 = a0.recv(Duration::from_secs(5)).await.expect("worker_0 delivery");
    let m1 = a1.recv(Duration::from_secs(5)).await.expect("worker_1 delivery");
    assert_eq!(m0.text(), Some("hi"));
    assert_eq!(m1.text(), Some("hi"));

    // One delivery attempt per worker in the snapshot, no more.
    assert!(a0.recv(Duration::from_millis(300)).await.is_none());
    assert!(a1.recv(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn empty_worker_list_reports_no_ack() {
    let dir = tempfile::tempdir().unwrap();
    let plane = start_plane(dir.path(), &[]).await;
    plane.registry.publish(&[]).unwrap();

    let producer = client_layer(&plane);
    let ack = producer
        .group_send("room", GroupMessage::new("chat", b"hi".to_vec()))
        .await
        .unwrap();
    assert!(!ack);
}

#[tokio::test]
async fn invalid_group_name_fails_without_touching_state() {
    let dir = tempfile::tempdir().unwrap();
    let plane = start_plane(dir.path(), &["worker_0"]).await;

    let producer = client_layer(&plane);
    let err = producer
        .group_send("not a name!", GroupMessage::new("chat", b"x".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, FabricError::InvalidGroupName(_)));

    let adopter = Adopter::new();
    let err = plane.workers[0]
        .group_add("not a name!", &adopter)
        .await
        .unwrap_err();
    assert!(matches!(err, FabricError::InvalidGroupName(_)));
    assert_eq!(
        plane.workers[0].backend().subscriber_count("not a name!").await,
        0
    );
}

#[tokio::test]
async fn unreachable_worker_does_not_abort_the_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let plane = start_plane(dir.path(), &["worker_0"]).await;

    // ghost_9 is in the shared list but nothing serves its endpoint.
    plane
        .registry
        .publish(&["worker_0".to_string(), "ghost_9".to_string()])
        .unwrap();

    let a0 = Adopter::new();
    plane.workers[0].group_add("room", &a0).await.unwrap();

    let ack = plane
        .forwarder
        .group_send("room", GroupMessage::new("chat", b"hi".to_vec()))
        .await
        .unwrap();
    assert!(ack);
    assert!(a0.recv(Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn dead_stub_is_rebuilt_after_a_worker_restart() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = BindAddress::parse(&format!("unix:{}/rpc.socket", dir.path().display()))
        .unwrap();
    let settings = Settings::single_backend(&rpc);
    let registry = WorkerRegistry::new(dir.path().join("workers"));
    registry.publish(&["worker_0".to_string()]).unwrap();

    let layers =
        TransportLayers::from_settings(&settings, TransportRole::Server, "worker_0", None)
            .unwrap();
    let worker = layers.default_layer();
    let serving = Arc::clone(&worker);
    let server_task = tokio::spawn(async move { serving.run().await });
    assert!(await_endpoint(&rpc.namespaced("worker_0"), READY).await);

    let forwarder_layers = TransportLayers::from_settings(
        &settings,
        TransportRole::Forwarder,
        "master",
        Some(registry.clone()),
    )
    .unwrap();
    let forwarder = forwarder_layers.default_layer();

    let adopter = Adopter::new();
    worker.group_add("room", &adopter).await.unwrap();

    // Prime the stub cache with a successful delivery.
    forwarder
        .group_send("room", GroupMessage::new("chat", b"first".to_vec()))
        .await
        .unwrap();
    assert!(adopter.recv(Duration::from_secs(5)).await.is_some());

    // Take the worker's server down; the cached stub now points at a dead
    // channel, gets discarded on the failed send, and is rebuilt once the
    // endpoint is back.
    server_task.abort();
    let _ = server_task.await;
    sleep(Duration::from_millis(200)).await;
    let _ = forwarder
        .group_send("room", GroupMessage::new("chat", b"lost".to_vec()))
        .await;

    let serving = Arc::clone(&worker);
    tokio::spawn(async move { serving.run().await });
    assert!(await_endpoint(&rpc.namespaced("worker_0"), READY).await);

    let mut delivered = false;
    for attempt in 0..20 {
        let _ = forwarder
            .group_send(
                "room",
                GroupMessage::new("chat", format!("retry-{attempt}").into_bytes()),
            )
            .await;
        if adopter.recv(Duration::from_millis(300)).await.is_some() {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "fan-out never recovered after the worker restart");
}
