use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn, Span};

use super::response::ActionResponse;
use crate::mqtt::message_manager::ReplyMessage;
use crate::routing::topic::{FACTORY_RESET_TOPIC, REBOOT_TOPIC};
use crate::routing::MessageHandler;

/// Device-side implementation of the remote device actions
///
/// Each action returns 202 when it was started, 500 when it failed to start
/// and 501 when the device does not support it.
pub trait DeviceActions: Send + Sync {
    fn reboot(&self) -> ActionResponse;

    fn factory_reset(&self) -> ActionResponse {
        ActionResponse::unsupported("factory reset is not supported")
    }
}

/// Routes reboot and factory reset requests to [`DeviceActions`]
pub struct DeviceActionHandler {
    actions: Arc<dyn DeviceActions>,
    span: Span,
}

impl DeviceActionHandler {
    pub fn new(actions: Arc<dyn DeviceActions>, span: Span) -> Self {
        Self { actions, span }
    }

    pub fn topics() -> [&'static str; 2] {
        [REBOOT_TOPIC, FACTORY_RESET_TOPIC]
    }
}

impl MessageHandler for DeviceActionHandler {
    fn name(&self) -> &str {
        "device-action"
    }

    fn on_document(&self, topic: &str, document: &Value) -> Option<ReplyMessage> {
        let response = match topic {
            REBOOT_TOPIC => self.actions.reboot(),
            FACTORY_RESET_TOPIC => self.actions.factory_reset(),
            other => {
                warn!(parent: &self.span, "Device action requested on unexpected topic {}", other);
                ActionResponse::unsupported(format!("no device action on {other}"))
            }
        };
        info!(parent: &self.span, "Device action on {} answered with {}", topic, response.code());
        Some(response.into_reply(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RebootOnly;

    impl DeviceActions for RebootOnly {
        fn reboot(&self) -> ActionResponse {
            ActionResponse::accepted()
        }
    }

    #[test]
    fn dispatches_by_topic() {
        let handler = DeviceActionHandler::new(Arc::new(RebootOnly), Span::none());

        let reply = handler.on_document(REBOOT_TOPIC, &json!({"reqId": "r1"})).unwrap();
        assert_eq!(reply.topic, "iotdevice-1/response");
        assert_eq!(reply.payload, json!({"rc": 202, "reqId": "r1"}));

        let reply = handler.on_document(FACTORY_RESET_TOPIC, &json!({"reqId": "r2"})).unwrap();
        assert_eq!(reply.payload["rc"], 501);
        assert_eq!(reply.payload["reqId"], "r2");
    }
}
