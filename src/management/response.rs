use serde_json::{Map, Value};

use crate::correlation::REQUEST_ID_FIELD;
use crate::mqtt::message_manager::ReplyMessage;
use crate::routing::topic::DEVICE_RESPONSE_TOPIC;

pub const RC_OK: i32 = 200;
pub const RC_ACCEPTED: i32 = 202;
pub const RC_CHANGED: i32 = 204;
pub const RC_FAILED: i32 = 500;
pub const RC_UNSUPPORTED: i32 = 501;

/// Outcome of a device action, firmware step or attribute update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResponse {
    code: i32,
    message: String,
}

impl ActionResponse {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(RC_OK, "")
    }

    pub fn accepted() -> Self {
        Self::new(RC_ACCEPTED, "")
    }

    pub fn changed() -> Self {
        Self::new(RC_CHANGED, "")
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RC_FAILED, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(RC_UNSUPPORTED, message)
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_accepted(&self) -> bool {
        self.code == RC_ACCEPTED
    }

    /// `{"rc", "message"?, "reqId"}` on the device response topic
    pub fn into_reply(self, request: &Value) -> ReplyMessage {
        let req_id = request
            .get(REQUEST_ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut payload = Map::new();
        payload.insert("rc".to_string(), Value::from(self.code));
        if !self.message.is_empty() {
            payload.insert("message".to_string(), Value::String(self.message));
        }
        payload.insert(REQUEST_ID_FIELD.to_string(), Value::String(req_id.to_string()));

        ReplyMessage::at_least_once(DEVICE_RESPONSE_TOPIC, Value::Object(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_echoes_request_id() {
        let reply = ActionResponse::accepted().into_reply(&json!({"reqId": "abc"}));
        assert_eq!(reply.topic, "iotdevice-1/response");
        assert_eq!(reply.payload, json!({"rc": 202, "reqId": "abc"}));

        let reply = ActionResponse::failed("disk error").into_reply(&json!({}));
        assert_eq!(
            reply.payload,
            json!({"rc": 500, "message": "disk error", "reqId": ""})
        );
    }
}
