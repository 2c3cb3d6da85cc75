//! Worker-side connection handling: WebSocket handshake, middleware
//! chain resolution, and the bridge from a matched route to a running
//! consumer.

use crate::consumer::{
    run_consumer, Consumer, ConsumerContext, SubscriberState, WsSink, WsSource,
};
use crate::error::FabricError;
use crate::middleware::{ConnectionOutcome, ConsumerTarget, MiddlewareStack, Scope};
use crate::transport::TransportLayer;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

/// One accepted client connection as the middleware stack sees it.
pub struct ClientConnection {
    /// Request path including any query string.
    pub path: String,
    /// Request headers, names lowercased.
    pub headers: HashMap<String, String>,
    /// Populated by `ScopeMiddleware`.
    pub scope: Option<Scope>,
    sink: Arc<Mutex<WsSink>>,
    source: Option<WsSource>,
    layer: Arc<TransportLayer>,
}

impl ClientConnection {
    pub fn new(
        path: String,
        headers: HashMap<String, String>,
        sink: Arc<Mutex<WsSink>>,
        source: WsSource,
        layer: Arc<TransportLayer>,
    ) -> Self {
        Self {
            path,
            headers,
            scope: None,
            sink,
            source: Some(source),
            layer,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Sends a close frame with the given code. Errors are ignored; the
    /// peer may already be gone.
    pub async fn close_with(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(Some(frame))).await;
    }

    /// Builds the context a consumer runs with: the current scope, the
    /// socket's write half, fresh subscription state, and the transport
    /// layer of the hosting worker.
    pub fn consumer_context(&self) -> ConsumerContext {
        ConsumerContext::new(
            self.scope.clone().unwrap_or_default(),
            Arc::clone(&self.sink),
            Arc::new(SubscriberState::new()),
            Arc::clone(&self.layer),
        )
    }

    /// Takes the socket's read half. Only one consumer can own it.
    pub fn take_source(&mut self) -> Option<WsSource> {
        self.source.take()
    }
}

/// Route target that constructs a consumer per connection and drives it.
pub struct ConsumerEntry<C, F> {
    factory: F,
    _marker: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, F> ConsumerTarget for ConsumerEntry<C, F>
where
    C: Consumer,
    F: Fn(&Scope) -> C + Send + Sync + 'static,
{
    async fn run(
        &self,
        conn: &mut ClientConnection,
    ) -> Result<ConnectionOutcome, FabricError> {
        let ctx = conn.consumer_context();
        let source = conn.take_source().ok_or_else(|| {
            FabricError::Handler("connection already claimed by a consumer".into())
        })?;
        let consumer = (self.factory)(&ctx.scope);
        Ok(run_consumer(consumer, C::handlers(), ctx, source).await)
    }
}

/// Wraps a consumer factory into a route target.
///
/// ```ignore
/// Router::new().route("/chat/{room}", as_consumer(|scope| ChatConsumer::new(scope)))
/// ```
pub fn as_consumer<C, F>(factory: F) -> Arc<dyn ConsumerTarget>
where
    C: Consumer,
    F: Fn(&Scope) -> C + Send + Sync + 'static,
{
    Arc::new(ConsumerEntry {
        factory,
        _marker: PhantomData,
    })
}

/// Accepts one client socket and runs it through the middleware stack.
///
/// A `Stop` outcome (or the stop sentinel surfacing as an error) closes
/// the socket with code 1000. Nothing that happens here outlives the
/// connection.
pub async fn handle_connection<S>(
    stream: S,
    stack: Arc<MiddlewareStack>,
    layer: Arc<TransportLayer>,
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

    let socket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!("websocket handshake failed: {err}");
            return;
        }
    };

    let (sink, source) = socket.split();
    let mut conn = ClientConnection::new(
        path,
        headers,
        Arc::new(Mutex::new(Box::pin(sink) as WsSink)),
        Box::pin(source) as WsSource,
        layer,
    );

    match stack.run(&mut conn).await {
        Ok(ConnectionOutcome::Continue) => {}
        Ok(ConnectionOutcome::Stop) => conn.close_with(1000, "").await,
        Err(err) => {
            if !err.is_stop() {
                error!("connection handler error: {err}");
            }
            conn.close_with(1000, "").await;
        }
    }
}
