//! # Connection Middleware Chain
//!
//! Every accepted connection runs through a stack of async middlewares
//! before (and around) its consumer. Each middleware receives the
//! connection plus a [`Next`] that resolves the tail of the stack; the
//! last middleware is responsible for routing the connection to a
//! consumer.
//!
//! Control flow is carried by [`ConnectionOutcome`] rather than an
//! exception: `Stop` asks the connection handler for a clean close with
//! WebSocket code 1000, `Continue` means the connection ended on its own
//! terms.
//!
//! The reference stack, in order:
//!
//! 1. [`ScopeMiddleware`] builds a fresh [`Scope`] from the request
//!    (headers, cookies) and populates the session through the external
//!    session hook.
//! 2. [`AuthMiddleware`] resolves the user from the session through the
//!    external auth hook, on a worker thread because the hook is
//!    synchronous and may touch a database.
//! 3. [`RouteMiddleware`] matches the request path against the route
//!    table and hands the connection to the first matching consumer;
//!    a miss closes the socket with code 1003.

use crate::error::FabricError;
use crate::handler::ClientConnection;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the connection handler should do once the chain returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The connection ended normally; nothing left to do.
    Continue,
    /// A consumer (or middleware) requested a clean close, code 1000.
    Stop,
}

/// Captured route information for the consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlRoute {
    pub url: String,
    pub params: HashMap<String, String>,
}

/// Per-connection metadata assembled by the middleware stack.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub session: Option<HashMap<String, String>>,
    pub user: Option<String>,
    pub url_route: Option<UrlRoute>,
}

/// External session resolution, typically backed by the surrounding web
/// application's session store.
pub trait SessionHook: Send + Sync {
    fn resolve(&self, cookies: &HashMap<String, String>) -> HashMap<String, String>;
}

/// External user resolution from an established session.
pub trait AuthHook: Send + Sync {
    fn resolve(&self, session: &HashMap<String, String>) -> Option<String>;
}

/// Session hook that yields an empty session. Default for deployments
/// without a session store.
pub struct NullSessionHook;

impl SessionHook for NullSessionHook {
    fn resolve(&self, _cookies: &HashMap<String, String>) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Auth hook that never resolves a user.
pub struct NullAuthHook;

impl AuthHook for NullAuthHook {
    fn resolve(&self, _session: &HashMap<String, String>) -> Option<String> {
        None
    }
}

/// One element of the connection middleware stack.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        conn: &mut ClientConnection,
        next: Next<'_>,
    ) -> Result<ConnectionOutcome, FabricError>;
}

/// The unresolved tail of a middleware stack.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    /// Runs the remainder of the stack.
    pub async fn run(
        self,
        conn: &mut ClientConnection,
    ) -> Result<ConnectionOutcome, FabricError> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                middleware.handle(conn, Next { rest }).await
            }
            None => Ok(ConnectionOutcome::Continue),
        }
    }
}

/// An ordered, resolved middleware stack. Resolved once per process and
/// shared across connections.
pub struct MiddlewareStack {
    stack: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn new(stack: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stack }
    }

    pub async fn run(
        &self,
        conn: &mut ClientConnection,
    ) -> Result<ConnectionOutcome, FabricError> {
        Next { rest: &self.stack }.run(conn).await
    }
}

/// Splits a `Cookie` header into key/value pairs the way browsers send
/// them: `;`-separated, first `=` splits, values trimmed and unquoted,
/// anything after a newline discarded.
pub fn parse_cookies(header: Option<&str>) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    let Some(header) = header else {
        return cookies;
    };
    for cookie in header.split(';') {
        let (key, value) = match cookie.split_once('=') {
            Some((key, value)) => (key, value),
            None => ("", cookie),
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value.lines().next().unwrap_or("");
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        cookies.insert(key.to_string(), value.to_string());
    }
    cookies
}

/// Builds the connection scope: headers, cookies, and the session
/// resolved through the external hook.
pub struct ScopeMiddleware {
    session_hook: Arc<dyn SessionHook>,
}

impl ScopeMiddleware {
    pub fn new(session_hook: Arc<dyn SessionHook>) -> Self {
        Self { session_hook }
    }
}

#[async_trait]
impl Middleware for ScopeMiddleware {
    async fn handle(
        &self,
        conn: &mut ClientConnection,
        next: Next<'_>,
    ) -> Result<ConnectionOutcome, FabricError> {
        let cookies = parse_cookies(conn.header("cookie"));

        let hook = Arc::clone(&self.session_hook);
        let hook_cookies = cookies.clone();
        let session = tokio::task::spawn_blocking(move || hook.resolve(&hook_cookies))
            .await
            .map_err(|err| FabricError::Handler(err.to_string()))?;

        conn.scope = Some(Scope {
            path: conn.path.clone(),
            headers: conn.headers.clone(),
            cookies,
            session: Some(session),
            user: None,
            url_route: None,
        });
        next.run(conn).await
    }
}

/// Resolves the connection's user from its session.
pub struct AuthMiddleware {
    auth_hook: Arc<dyn AuthHook>,
}

impl AuthMiddleware {
    pub fn new(auth_hook: Arc<dyn AuthHook>) -> Self {
        Self { auth_hook }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        conn: &mut ClientConnection,
        next: Next<'_>,
    ) -> Result<ConnectionOutcome, FabricError> {
        let session = conn
            .scope
            .as_ref()
            .and_then(|scope| scope.session.clone())
            .ok_or_else(|| {
                FabricError::NotConfigured(
                    "AuthMiddleware requires ScopeMiddleware to run first".into(),
                )
            })?;

        // The auth hook is synchronous and may hit a database; keep it off
        // the event loop.
        let hook = Arc::clone(&self.auth_hook);
        let user = tokio::task::spawn_blocking(move || hook.resolve(&session))
            .await
            .map_err(|err| FabricError::Handler(err.to_string()))?;

        if let Some(scope) = conn.scope.as_mut() {
            scope.user = user;
        }
        next.run(conn).await
    }
}

/// The terminal stage of a route: adopts the connection and runs a
/// consumer over it.
#[async_trait]
pub trait ConsumerTarget: Send + Sync {
    async fn run(
        &self,
        conn: &mut ClientConnection,
    ) -> Result<ConnectionOutcome, FabricError>;
}

enum Segment {
    Literal(String),
    Param(String),
}

/// One route table entry: a `/`-separated pattern where `{name}` segments
/// capture into the scope's `url_route.params`.
pub struct RoutePattern {
    pattern: String,
    segments: Vec<Segment>,
    target: Arc<dyn ConsumerTarget>,
}

impl RoutePattern {
    pub fn new(pattern: &str, target: Arc<dyn ConsumerTarget>) -> Self {
        let segments = pattern
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => Segment::Param(name.to_string()),
                    None => Segment::Literal(segment.to_string()),
                }
            })
            .collect();
        Self {
            pattern: pattern.to_string(),
            segments,
            target,
        }
    }

    /// Matches `path` against the pattern, capturing parameter segments.
    pub fn resolve(&self, path: &str) -> Option<HashMap<String, String>> {
        let path = path.split('?').next().unwrap_or(path);
        let parts: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

/// Ordered route table; the first matching pattern wins.
#[derive(Default)]
pub struct Router {
    patterns: Vec<RoutePattern>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn route(mut self, pattern: &str, target: Arc<dyn ConsumerTarget>) -> Self {
        self.patterns.push(RoutePattern::new(pattern, target));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Routes the connection to the first matching consumer.
pub struct RouteMiddleware {
    router: Arc<Router>,
}

impl RouteMiddleware {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Middleware for RouteMiddleware {
    async fn handle(
        &self,
        conn: &mut ClientConnection,
        _next: Next<'_>,
    ) -> Result<ConnectionOutcome, FabricError> {
        for pattern in &self.router.patterns {
            let Some(params) = pattern.resolve(&conn.path) else {
                continue;
            };
            debug!("path `{}` matched route `{}`", conn.path, pattern.pattern);
            if let Some(scope) = conn.scope.as_mut() {
                scope.url_route = Some(UrlRoute {
                    url: conn.path.clone(),
                    params,
                });
            }
            return pattern.target.run(conn).await;
        }

        warn!("no route matched path `{}`", conn.path);
        conn.close_with(1003, "not_found").await;
        Ok(ConnectionOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_parses_pairs() {
        let cookies =
            parse_cookies(Some("sessionid=abc123; theme=dark ; malformed"));
        assert_eq!(cookies.get("sessionid").map(String::as_str), Some("abc123"));
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn cookie_values_are_unquoted_and_single_line() {
        let cookies = parse_cookies(Some("token=\"quoted\"; evil=a\nb"));
        assert_eq!(cookies.get("token").map(String::as_str), Some("quoted"));
        assert_eq!(cookies.get("evil").map(String::as_str), Some("a"));
    }

    #[test]
    fn missing_cookie_header_is_empty() {
        assert!(parse_cookies(None).is_empty());
    }

    struct NoTarget;

    #[async_trait]
    impl ConsumerTarget for NoTarget {
        async fn run(
            &self,
            _conn: &mut ClientConnection,
        ) -> Result<ConnectionOutcome, FabricError> {
            Ok(ConnectionOutcome::Continue)
        }
    }

    #[test]
    fn route_patterns_capture_params() {
        let pattern = RoutePattern::new("/chat/{room}/", Arc::new(NoTarget));
        let params = pattern.resolve("/chat/lobby/").unwrap();
        assert_eq!(params.get("room").map(String::as_str), Some("lobby"));

        // Trailing slash and query string are not significant.
        assert!(pattern.resolve("/chat/lobby").is_some());
        assert!(pattern.resolve("/chat/lobby?token=1").is_some());

        assert!(pattern.resolve("/chat/").is_none());
        assert!(pattern.resolve("/chat/lobby/extra").is_none());
        assert!(pattern.resolve("/other/lobby").is_none());
    }

    #[test]
    fn literal_routes_match_exactly() {
        let pattern = RoutePattern::new("/ws/echo", Arc::new(NoTarget));
        assert!(pattern.resolve("/ws/echo").is_some());
        assert!(pattern.resolve("/ws/Echo").is_none());
    }
}
