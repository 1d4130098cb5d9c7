//! Outbound reply serialization
//!
//! Handlers never publish directly. They return a
//! [`ReplyMessage`](crate::mqtt::message_manager::ReplyMessage) which is
//! queued FIFO and published by the single dispatcher worker.

pub mod reply_dispatcher;

pub use reply_dispatcher::{
    Configured, DispatchStats, DispatcherSettings, ReplyDispatcher, ReplyQueue, Running, Stopped,
};
