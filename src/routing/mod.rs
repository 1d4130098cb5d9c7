//! # Inbound Routing
//!
//! ```text
//! routing/
//! ├── handler.rs   - MessageHandler and CommandCallback capabilities
//! ├── registry.rs  - Topic subscriptions and handler bindings
//! ├── router.rs    - Inbound entry point
//! └── topic.rs     - Topic vocabulary and command topic tokenizer
//! ```
//!
//! Flow of one inbound message:
//!
//! ```text
//! transport ──► CallbackRouter::on_message
//!                 ├─ handlers bound to topic? ──► on_document / on_raw ──► ReplyQueue
//!                 └─ none ──► CommandTopic::parse ──► CommandCallback
//! ```

pub mod handler;
pub mod registry;
pub mod router;
pub mod topic;

pub use handler::{CommandCallback, HandlerRef, MessageHandler};
pub use registry::{SharedRegistry, SubscriptionRegistry};
pub use router::{CallbackRouter, RouterStats};
pub use topic::{CommandTopic, TopicError};
