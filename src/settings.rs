//! # Settings Contract
//!
//! Deployment configuration consumed from the environment plus the
//! pieces an embedding application registers in code.
//!
//! From the environment:
//!
//! - `WEBSOCKET_TRANSPORT_BACKENDS`: a JSON document mapping layer
//!   aliases to `{ "BACKEND": ..., "CONFIG": { "address", "num_connections",
//!   "prefix", "queue_depth" } }`. The `default` alias is required.
//! - `WEBSOCKET_MIDDLEWARE`: optional comma-separated middleware names
//!   applied per connection, top to bottom. Unset means the reference
//!   stack (`ScopeMiddleware`, `AuthMiddleware`, `RouteMiddleware`).
//!
//! Routes, session/auth hooks, and any custom middleware are registered
//! in code on [`Settings`]; there is no import-by-name here, so the
//! middleware variable refers to names registered up front (the
//! reference middlewares are always known).
//!
//! Missing or malformed required settings fail startup with
//! [`FabricError::NotConfigured`].

use crate::bind::BindAddress;
use crate::error::FabricError;
use crate::middleware::{
    AuthHook, AuthMiddleware, Middleware, MiddlewareStack, NullAuthHook,
    NullSessionHook, RouteMiddleware, Router, ScopeMiddleware, SessionHook,
};
use crate::transport::LayerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Environment variable holding the transport backend document.
pub const TRANSPORT_BACKENDS_VAR: &str = "WEBSOCKET_TRANSPORT_BACKENDS";

/// Environment variable holding the middleware order.
pub const MIDDLEWARE_VAR: &str = "WEBSOCKET_MIDDLEWARE";

/// Raw per-alias transport configuration as it appears in the settings
/// document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportBackendConfig {
    pub address: Option<String>,
    pub num_connections: Option<usize>,
    pub prefix: Option<String>,
    pub queue_depth: Option<usize>,
}

/// One entry of the transport backend map.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportBackendEntry {
    /// Transport implementation selector. Only the gRPC plane exists;
    /// absent means gRPC.
    #[serde(rename = "BACKEND", default)]
    pub backend: Option<String>,
    #[serde(rename = "CONFIG", default)]
    pub config: TransportBackendConfig,
}

impl TransportBackendEntry {
    /// Resolves the raw entry into a concrete layer configuration,
    /// applying defaults.
    pub fn resolve(&self, alias: &str) -> Result<LayerConfig, FabricError> {
        if let Some(backend) = &self.backend {
            if !backend.to_ascii_lowercase().contains("grpc") {
                return Err(FabricError::NotConfigured(format!(
                    "unknown transport backend `{backend}` for alias `{alias}`"
                )));
            }
        }
        let address = self
            .config
            .address
            .as_deref()
            .unwrap_or(crate::defaults::RPC_ADDRESS);
        Ok(LayerConfig {
            address: BindAddress::parse(address)?,
            num_connections: self
                .config
                .num_connections
                .unwrap_or(crate::defaults::NUM_CONNECTIONS),
            prefix: self
                .config
                .prefix
                .clone()
                .unwrap_or_else(|| alias.to_string()),
            queue_depth: self
                .config
                .queue_depth
                .unwrap_or(crate::defaults::QUEUE_DEPTH),
        })
    }
}

/// Assembled process settings: the environment-backed transport map plus
/// the code-registered route table, hooks, and middleware.
pub struct Settings {
    transport: HashMap<String, TransportBackendEntry>,
    middleware_order: Option<Vec<String>>,
    session_hook: Arc<dyn SessionHook>,
    auth_hook: Arc<dyn AuthHook>,
    router: Arc<Router>,
    registered: HashMap<String, Arc<dyn Middleware>>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("transport", &self.transport)
            .field("middleware_order", &self.middleware_order)
            .field("registered", &self.registered.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Reads the required settings from the environment.
    pub fn from_env() -> Result<Self, FabricError> {
        let document = std::env::var(TRANSPORT_BACKENDS_VAR).map_err(|_| {
            FabricError::NotConfigured(format!(
                "`{TRANSPORT_BACKENDS_VAR}` is not set"
            ))
        })?;
        let mut settings = Self::from_json(&document)?;
        if let Ok(order) = std::env::var(MIDDLEWARE_VAR) {
            settings.middleware_order = Some(
                order
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        Ok(settings)
    }

    /// Parses a transport backend document.
    pub fn from_json(document: &str) -> Result<Self, FabricError> {
        let transport: HashMap<String, TransportBackendEntry> =
            serde_json::from_str(document).map_err(|err| {
                FabricError::NotConfigured(format!(
                    "`{TRANSPORT_BACKENDS_VAR}` is not valid JSON: {err}"
                ))
            })?;
        Self::new(transport)
    }

    /// Builds settings from an explicit transport map. The `default`
    /// alias is required.
    pub fn new(
        transport: HashMap<String, TransportBackendEntry>,
    ) -> Result<Self, FabricError> {
        if !transport.contains_key("default") {
            return Err(FabricError::NotConfigured(format!(
                "`{TRANSPORT_BACKENDS_VAR}` must have a `default` item"
            )));
        }
        Ok(Self {
            transport,
            middleware_order: None,
            session_hook: Arc::new(NullSessionHook),
            auth_hook: Arc::new(NullAuthHook),
            router: Arc::new(Router::new()),
            registered: HashMap::new(),
        })
    }

    /// Settings with a single `default` layer at `address`. Convenient
    /// for embedding applications and tests.
    pub fn single_backend(address: &BindAddress) -> Self {
        let entry = TransportBackendEntry {
            backend: None,
            config: TransportBackendConfig {
                address: Some(address.to_string()),
                ..Default::default()
            },
        };
        Self::new(HashMap::from([("default".to_string(), entry)]))
            .expect("default alias is present")
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = Arc::new(router);
        self
    }

    pub fn with_session_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.session_hook = hook;
        self
    }

    pub fn with_auth_hook(mut self, hook: Arc<dyn AuthHook>) -> Self {
        self.auth_hook = hook;
        self
    }

    /// Makes a custom middleware addressable from `WEBSOCKET_MIDDLEWARE`.
    pub fn register_middleware(
        mut self,
        name: impl Into<String>,
        middleware: Arc<dyn Middleware>,
    ) -> Self {
        self.registered.insert(name.into(), middleware);
        self
    }

    pub fn transport_backends(
        &self,
    ) -> impl Iterator<Item = (&String, &TransportBackendEntry)> {
        self.transport.iter()
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Resolves the middleware order into a runnable stack.
    pub fn middleware_stack(&self) -> Result<MiddlewareStack, FabricError> {
        let reference_order = || {
            vec![
                "ScopeMiddleware".to_string(),
                "AuthMiddleware".to_string(),
                "RouteMiddleware".to_string(),
            ]
        };
        let order = self
            .middleware_order
            .clone()
            .unwrap_or_else(reference_order);

        let mut stack: Vec<Arc<dyn Middleware>> = Vec::with_capacity(order.len());
        for name in &order {
            if let Some(middleware) = self.registered.get(name) {
                stack.push(Arc::clone(middleware));
                continue;
            }
            let middleware: Arc<dyn Middleware> = match name.as_str() {
                "ScopeMiddleware" => Arc::new(ScopeMiddleware::new(Arc::clone(
                    &self.session_hook,
                ))),
                "AuthMiddleware" => {
                    Arc::new(AuthMiddleware::new(Arc::clone(&self.auth_hook)))
                }
                "RouteMiddleware" => {
                    Arc::new(RouteMiddleware::new(Arc::clone(&self.router)))
                }
                _ => {
                    return Err(FabricError::NotConfigured(format!(
                        "`{MIDDLEWARE_VAR}` names an unregistered middleware \
                         `{name}`"
                    )))
                }
            };
            stack.push(middleware);
        }
        Ok(MiddlewareStack::new(stack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_with_default_parses() {
        let settings = Settings::from_json(
            r#"{
                "default": {
                    "BACKEND": "ws_fabric.transport.GrpcTransportLayer",
                    "CONFIG": {
                        "address": "unix:/tmp/rpc.socket",
                        "num_connections": 8
                    }
                }
            }"#,
        )
        .unwrap();
        let (_, entry) = settings
            .transport_backends()
            .find(|(alias, _)| alias.as_str() == "default")
            .unwrap();
        let config = entry.resolve("default").unwrap();
        assert_eq!(config.address.to_string(), "unix:/tmp/rpc.socket");
        assert_eq!(config.num_connections, 8);
        assert_eq!(config.prefix, "default");
        assert_eq!(config.queue_depth, crate::defaults::QUEUE_DEPTH);
    }

    #[test]
    fn missing_default_is_rejected() {
        let err = Settings::from_json(r#"{"other": {}}"#).unwrap_err();
        assert!(matches!(err, FabricError::NotConfigured(_)));
    }

    #[test]
    fn malformed_document_is_rejected() {
        assert!(Settings::from_json("not json").is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let entry = TransportBackendEntry {
            backend: Some("redis".to_string()),
            config: TransportBackendConfig::default(),
        };
        assert!(entry.resolve("default").is_err());
    }

    #[test]
    fn empty_config_resolves_to_defaults() {
        let entry = TransportBackendEntry::default();
        let config = entry.resolve("default").unwrap();
        assert_eq!(config.address.to_string(), crate::defaults::RPC_ADDRESS);
        assert_eq!(config.num_connections, crate::defaults::NUM_CONNECTIONS);
    }

    #[test]
    fn unregistered_middleware_name_fails() {
        let bind = BindAddress::parse("unix:/tmp/rpc.socket").unwrap();
        let mut settings = Settings::single_backend(&bind);
        settings.middleware_order = Some(vec!["NoSuchMiddleware".to_string()]);
        assert!(settings.middleware_stack().is_err());
    }

    #[test]
    fn reference_stack_resolves() {
        let bind = BindAddress::parse("unix:/tmp/rpc.socket").unwrap();
        let settings = Settings::single_backend(&bind);
        assert!(settings.middleware_stack().is_ok());
    }
}
