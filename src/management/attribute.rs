use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn, Span};

use super::device_data::DeviceLocation;
use crate::mqtt::message_manager::ReplyMessage;
use crate::routing::topic::DEVICE_UPDATE_TOPIC;
use crate::routing::MessageHandler;

/// Device-side handling of attribute updates pushed by the platform
///
/// The return value only feeds diagnostics. The protocol expects no reply.
pub trait AttributeActions: Send + Sync {
    fn update_location(&self, location: DeviceLocation) -> bool;

    fn update_metadata(&self, _metadata: &Value) -> bool {
        false
    }
}

/// Applies the first field of a device update to [`AttributeActions`]
pub struct AttributeHandler {
    actions: Arc<dyn AttributeActions>,
    span: Span,
}

impl AttributeHandler {
    pub fn new(actions: Arc<dyn AttributeActions>, span: Span) -> Self {
        Self { actions, span }
    }

    pub fn topics() -> [&'static str; 1] {
        [DEVICE_UPDATE_TOPIC]
    }
}

/// First entry of `d.fields`, as `(field, value)`
pub(crate) fn first_field(document: &Value) -> Option<(&str, &Value)> {
    let field = document.get("d")?.get("fields")?.get(0)?;
    let name = field.get("field")?.as_str()?;
    Some((name, field.get("value").unwrap_or(&Value::Null)))
}

impl MessageHandler for AttributeHandler {
    fn name(&self) -> &str {
        "attribute-update"
    }

    fn on_document(&self, topic: &str, document: &Value) -> Option<ReplyMessage> {
        let Some((field, value)) = first_field(document) else {
            warn!(parent: &self.span, "Attribute update on {} without fields", topic);
            return None;
        };

        let applied = match field {
            "location" => match serde_json::from_value::<DeviceLocation>(value.clone()) {
                Ok(location) => self.actions.update_location(location),
                Err(e) => {
                    warn!(parent: &self.span, "Invalid location update: {}", e);
                    false
                }
            },
            "metadata" => self.actions.update_metadata(value),
            other => {
                debug!(parent: &self.span, "Attribute field {} not handled here", other);
                return None;
            }
        };

        debug!(parent: &self.span, "Attribute {} update applied: {}", field, applied);
        None
    }
}
