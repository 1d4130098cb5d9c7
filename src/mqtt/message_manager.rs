use chrono::{DateTime, Local};
use serde_json::Value;
use std::fmt;

use super::QoS;

/// Outbound protocol reply waiting in the dispatcher queue
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
    pub topic: String,
    pub payload: Value,
    pub qos: QoS,
    pub created: DateTime<Local>,
}

impl fmt::Display for ReplyMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = self.payload.to_string();
        let preview: String = content.chars().take(40).collect();
        write!(f, "{} - {} {}", self.created.format("%H:%M:%S%.3f"), self.topic, preview)
    }
}

impl ReplyMessage {
    pub fn new(topic: impl Into<String>, payload: Value, qos: QoS) -> Self {
        ReplyMessage {
            topic: topic.into(),
            payload,
            qos,
            created: Local::now(),
        }
    }

    /// Reply at QoS 1, the level the platform expects for protocol replies
    pub fn at_least_once(topic: impl Into<String>, payload: Value) -> Self {
        Self::new(topic, payload, QoS::AtLeastOnce)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.payload.to_string().into_bytes()
    }
}

/// Command delivered to the application callback
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub device_type: String,
    pub device_id: String,
    pub command_name: String,
    pub format: String,
    pub payload: Vec<u8>,
    pub received: DateTime<Local>,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} {} ({}, {} bytes)",
            self.device_type,
            self.device_id,
            self.command_name,
            self.format,
            self.payload.len()
        )
    }
}

impl Command {
    /// Payload parsed as JSON, when the command was sent with a JSON format
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_serializes_payload() {
        let reply = ReplyMessage::at_least_once("iotdevice-1/response", json!({"rc": 202}));
        assert_eq!(reply.qos, QoS::AtLeastOnce);
        assert_eq!(reply.to_bytes(), br#"{"rc":202}"#.to_vec());
        assert!(reply.to_string().contains("iotdevice-1/response"));
    }

    #[test]
    fn command_json_payload() {
        let command = Command {
            device_type: "raspi".to_string(),
            device_id: "pi1".to_string(),
            command_name: "blink".to_string(),
            format: "json".to_string(),
            payload: br#"{"rate": 2}"#.to_vec(),
            received: Local::now(),
        };
        assert_eq!(command.json(), Some(json!({"rate": 2})));
        assert_eq!(command.to_string(), "raspi:pi1 blink (json, 11 bytes)");
    }
}
