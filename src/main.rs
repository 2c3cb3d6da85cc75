//! # Fabric Server - Main Entry Point
//!
//! Invoked three ways from the same executable:
//!
//! - with no `--role`, as the **orchestrator**: supervises the master
//!   and worker processes it spawns from this binary;
//! - with `--role master`, as the **master**: client-facing round-robin
//!   proxy plus the forwarder side of the RPC plane;
//! - with `--role worker`, as a **worker**: WebSocket serving plus the
//!   server side of the RPC plane.
//!
//! Transport configuration comes from `WEBSOCKET_TRANSPORT_BACKENDS` in
//! the environment (see [`ws_fabric::settings`]); spawned children
//! inherit it. The stock binary registers the reference application
//! routes below; embedding applications build their own router and call
//! into [`ws_fabric::server`] directly.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Parser;
use ws_fabric::cli::{Args, ProcessRole};
use ws_fabric::consumer::{Consumer, ConsumerContext, HandlerTable, SocketData};
use ws_fabric::error::FabricError;
use ws_fabric::groups::GroupMessage;
use ws_fabric::handler::as_consumer;
use ws_fabric::middleware::Router;
use ws_fabric::orchestrator::{Orchestrator, WorkerRegistry};
use ws_fabric::settings::Settings;
use ws_fabric::{logging, server};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| "orchestrator".to_string());
    let _log_guard = logging::init(
        &namespace,
        args.verbose,
        args.quiet,
        args.log_file.as_deref(),
    );

    match args.role {
        None => {
            // Fail configuration problems here, before any child is
            // spawned into a restart loop.
            reference_settings()?;
            let registry_path = std::env::temp_dir()
                .join(format!("ws-fabric-{}.workers", std::process::id()));
            let orchestrator = Orchestrator::new(
                args.bind.clone(),
                args.workers,
                WorkerRegistry::new(registry_path),
                args.verbose,
                args.quiet,
            );
            orchestrator.run().await?;
        }
        Some(ProcessRole::Master) => {
            let settings = reference_settings()?;
            let registry_path = args
                .registry
                .clone()
                .ok_or_else(|| anyhow!("--registry is required for the master role"))?;
            server::run_master(
                &args.bind,
                &settings,
                WorkerRegistry::new(registry_path),
            )
            .await?;
        }
        Some(ProcessRole::Worker) => {
            let settings = reference_settings()?;
            let namespace = args
                .namespace
                .ok_or_else(|| anyhow!("--namespace is required for the worker role"))?;
            server::run_worker(&namespace, &args.bind, &settings).await?;
        }
    }
    Ok(())
}

/// Environment settings plus the reference application's routes: an echo
/// endpoint and a per-room chat endpoint backed by groups.
fn reference_settings() -> Result<Settings, FabricError> {
    let router = Router::new()
        .route("/ws/echo", as_consumer(|_scope| EchoConsumer))
        .route(
            "/ws/chat/{room}",
            as_consumer(|_scope| ChatConsumer { room: None }),
        );
    Ok(Settings::from_env()?.with_router(router))
}

/// Answers `ping` with `pong` and mirrors everything else back.
struct EchoConsumer;

#[async_trait]
impl Consumer for EchoConsumer {
    async fn connect(&mut self, _ctx: &ConsumerContext) -> Result<(), FabricError> {
        Ok(())
    }

    async fn receive(
        &mut self,
        ctx: &ConsumerContext,
        data: SocketData,
    ) -> Result<(), FabricError> {
        match data {
            SocketData::Text(text) if text == "ping" => ctx.send_text("pong").await,
            SocketData::Text(text) => ctx.send_text(text).await,
            SocketData::Binary(data) => ctx.send_binary(data).await,
        }
    }
}

/// Joins the room named in the route and relays room traffic both ways.
struct ChatConsumer {
    room: Option<String>,
}

impl ChatConsumer {
    async fn chat(
        &mut self,
        ctx: &ConsumerContext,
        message: GroupMessage,
    ) -> Result<(), FabricError> {
        if let Some(text) = message.text() {
            ctx.send_text(text).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for ChatConsumer {
    async fn connect(&mut self, ctx: &ConsumerContext) -> Result<(), FabricError> {
        let room = ctx
            .scope
            .url_route
            .as_ref()
            .and_then(|route| route.params.get("room"))
            .cloned()
            .ok_or_else(|| {
                FabricError::Handler("chat route matched without a room".into())
            })?;
        ctx.group_add(&room).await?;
        self.room = Some(room);
        Ok(())
    }

    async fn receive(
        &mut self,
        ctx: &ConsumerContext,
        data: SocketData,
    ) -> Result<(), FabricError> {
        let SocketData::Text(text) = data else {
            return Ok(());
        };
        if let Some(room) = &self.room {
            ctx.group_send(room, GroupMessage::new("chat", text.into_bytes()))
                .await?;
        }
        Ok(())
    }

    fn handlers() -> HandlerTable<Self> {
        HandlerTable::new().on("chat", |consumer, ctx, message| {
            Box::pin(consumer.chat(ctx, message))
        })
    }
}
