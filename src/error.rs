//! Crate-level error type
//!
//! Each subsystem owns a narrow error enum; `ClientError` aggregates them so
//! the session API can propagate everything with `?`.

use crate::config::ConfigError;
use crate::mqtt::TransportError;

/// Errors surfaced by the managed client API
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Properties were rejected before any transport call was attempted
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The transport refused or did not complete an operation in time
    ///
    /// Raised at the call site that initiated the publish, subscribe,
    /// unsubscribe or connect.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A document could not be serialized for publishing
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation is not available for this kind of client
    ///
    /// For example publishing on behalf of an attached device from a plain
    /// device client.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}
