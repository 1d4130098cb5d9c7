use std::sync::Arc;

use serde_json::Value;

use crate::mqtt::message_manager::{Command, ReplyMessage};

/// Component that can answer an inbound message
///
/// Handlers run on the inbound delivery task and must return promptly.
/// Long-running work belongs in a spawned task that reports back through
/// the [`ReplyQueue`](crate::dispatch::ReplyQueue).
pub trait MessageHandler: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &str;

    /// Handles a payload that parsed as a JSON document
    fn on_document(&self, topic: &str, document: &Value) -> Option<ReplyMessage>;

    /// Handles a payload that is not JSON
    ///
    /// The default drops the message.
    fn on_raw(&self, _topic: &str, _payload: &[u8]) -> Option<ReplyMessage> {
        None
    }
}

pub type HandlerRef = Arc<dyn MessageHandler>;

/// Application callback for commands no handler claimed
pub trait CommandCallback: Send + Sync {
    fn on_command(&self, command: Command);
}

impl<F> CommandCallback for F
where
    F: Fn(Command) + Send + Sync,
{
    fn on_command(&self, command: Command) {
        self(command)
    }
}
