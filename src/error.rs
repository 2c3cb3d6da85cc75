//! Error taxonomy for the fabric.
//!
//! Local recovery is the rule throughout the crate: per-connection and
//! per-message failures are logged and absorbed where they occur, and only
//! configuration errors and signals are allowed to reach the process
//! top level.

use thiserror::Error;

/// Errors surfaced by the fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    /// A bind address that does not satisfy the accepted grammar.
    ///
    /// Fatal to the request that carried it (startup, in practice), never
    /// to a running process.
    #[error("invalid bind address `{input}`: {reason}")]
    InvalidBind { input: String, reason: String },

    /// A group name outside the accepted grammar. The offending operation
    /// fails without touching any state.
    #[error(
        "invalid group name `{0}`: group names must be non-empty ASCII \
         alphanumerics, hyphens, underscores, or periods, shorter than 100 \
         characters"
    )]
    InvalidGroupName(String),

    /// A required setting is missing or malformed. Fatal at startup.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// The RPC channel could not be opened or the call failed. The
    /// offending `group_send` reports `ack = false`; the process carries on.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The peer went away. Expected terminal condition for any
    /// per-connection loop.
    #[error("connection closed")]
    ConnectionClosed,

    /// An application handler failed. Logged by the calling loop, which
    /// then continues.
    #[error("handler error: {0}")]
    Handler(String),

    /// Sentinel requesting a clean close (WebSocket code 1000) and an
    /// orderly unwind of the consumer.
    #[error("consumer requested stop")]
    Stop,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FabricError {
    /// True for the sentinel that requests a clean close rather than
    /// reporting a failure.
    pub fn is_stop(&self) -> bool {
        matches!(self, FabricError::Stop)
    }
}
