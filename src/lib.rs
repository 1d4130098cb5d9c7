//! Device and gateway client for an IoT platform spoken over MQTT
//!
//! ```text
//! src/
//! ├── config.rs     - Device properties and engine settings
//! ├── error.rs      - Crate-level error type
//! ├── mqtt/         - Transport capability and the rumqttc implementation
//! ├── routing/      - Subscription registry, topic tokenizer, inbound router
//! ├── correlation/  - Request ids and response matching
//! ├── dispatch/     - Serialized outbound replies
//! └── management/   - Managed session, device actions, firmware, attributes
//! ```

pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod management;
pub mod mqtt;
pub mod routing;

pub use config::{ClientKind, ClientSettings, Properties};
pub use error::ClientError;
pub use management::{ManagedClient, ManagementHooks};
pub use mqtt::message_manager::Command;
pub use mqtt::{QoS, Transport, TransportError};
