//! # MQTT Transport Module
//!
//! The engine talks to the platform through the [`Transport`] capability:
//! publish, subscribe, unsubscribe and disconnect. Everything above this
//! module only ever sees the trait, which keeps the routing, correlation and
//! management code testable against an in-memory transport.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection options derived from device properties
//! ├── message_manager.rs  - Outbound reply and inbound command values
//! └── mqtt_handler.rs     - rumqttc client, event loop driver, connection status
//! ```
//!
//! Inbound messages never flow back through the trait. The event loop driver
//! in `mqtt_handler` hands every publish straight to the
//! [`CallbackRouter`](crate::routing::CallbackRouter).

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
pub use rumqttc::QoS;

/// Errors raised by the transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The client request queue rejected the operation
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The broker connection failed or was refused
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The operation was not completed within its completion timeout
    #[error("{operation} on '{topic}' timed out")]
    Timeout {
        operation: &'static str,
        topic: String,
    },

    /// The transport has been shut down
    #[error("Transport is closed")]
    Closed,

    /// Reading TLS material from disk failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The TLS material is unusable
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Quality of service outside 0..=2
    #[error("Invalid QoS level {0}")]
    InvalidQos(u8),
}

/// Publish/subscribe capability consumed by the engine
///
/// Each call returns once the underlying client accepted the operation.
/// Callers bound the call with their own completion timeout.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Maps an integer quality of service level onto [`QoS`]
pub fn qos_level(level: u8) -> Result<QoS, TransportError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::InvalidQos(other)),
    }
}

/// Runs a transport call with a completion timeout
pub(crate) async fn with_timeout<F>(
    operation: &'static str,
    topic: &str,
    limit: std::time::Duration,
    call: F,
) -> Result<(), TransportError>
where
    F: std::future::Future<Output = Result<(), TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            operation,
            topic: topic.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_qos_levels() {
        assert_eq!(qos_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_level(3), Err(TransportError::InvalidQos(3))));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_call_times_out() {
        let result = with_timeout(
            "publish",
            "iotdevice-1/response",
            std::time::Duration::from_millis(50),
            std::future::pending(),
        )
        .await;

        assert!(matches!(
            result,
            Err(TransportError::Timeout { operation: "publish", topic }) if topic == "iotdevice-1/response"
        ));
    }
}
