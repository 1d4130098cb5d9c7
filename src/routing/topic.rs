//! Platform topic vocabulary and the command topic tokenizer

/// Control-plane responses to management requests
pub const RESPONSE_TOPIC: &str = "iotdm-1/response";
pub const MANAGE_TOPIC: &str = "iotdevice-1/mgmt/manage";
pub const UNMANAGE_TOPIC: &str = "iotdevice-1/mgmt/unmanage";
/// Field updates pushed by the platform
pub const DEVICE_UPDATE_TOPIC: &str = "iotdm-1/device/update";
pub const LOCATION_UPDATE_TOPIC: &str = "iotdevice-1/device/update/location";
/// Device replies to platform-initiated requests
pub const DEVICE_RESPONSE_TOPIC: &str = "iotdevice-1/response";
pub const REBOOT_TOPIC: &str = "iotdm-1/mgmt/initiate/device/reboot";
pub const FACTORY_RESET_TOPIC: &str = "iotdm-1/mgmt/initiate/device/factory_reset";
pub const NOTIFY_TOPIC: &str = "iotdevice-1/notify";
pub const OBSERVE_TOPIC: &str = "iotdm-1/observe";
pub const CANCEL_TOPIC: &str = "iotdm-1/cancel";
pub const FIRMWARE_DOWNLOAD_TOPIC: &str = "iotdm-1/mgmt/initiate/firmware/download";
pub const FIRMWARE_UPDATE_TOPIC: &str = "iotdm-1/mgmt/initiate/firmware/update";
pub const ADD_ERROR_CODES_TOPIC: &str = "iotdevice-1/add/diag/errorCodes";
pub const CLEAR_ERROR_CODES_TOPIC: &str = "iotdevice-1/clear/diag/errorCodes";
pub const ADD_LOG_TOPIC: &str = "iotdevice-1/add/diag/log";
pub const CLEAR_LOG_TOPIC: &str = "iotdevice-1/clear/diag/log";

const ROOT: &str = "iot-2";

/// Errors raised while tokenizing a command topic
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// The topic does not start with `iot-2`
    #[error("Topic '{0}' does not start with iot-2")]
    WrongRoot(String),

    /// Markers and values do not come in pairs
    #[error("Topic '{0}' has a marker without value")]
    Unpaired(String),

    /// A segment in marker position is not one of type, id, cmd, fmt
    #[error("Unknown marker '{marker}' in topic '{topic}'")]
    UnknownMarker { topic: String, marker: String },

    #[error("Marker '{marker}' appears twice in topic '{topic}'")]
    DuplicateMarker { topic: String, marker: String },

    #[error("Marker '{marker}' has an empty value in topic '{topic}'")]
    EmptyValue { topic: String, marker: String },

    /// A required marker is absent
    #[error("Topic '{topic}' is missing the '{marker}' marker")]
    MissingMarker { topic: String, marker: &'static str },
}

/// Tokenized command topic
///
/// Gateway form: `iot-2/type/<T>/id/<I>/cmd/<C>/fmt/<F>`.
/// Device form: `iot-2/cmd/<C>/fmt/<F>`, which carries no type or id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    pub device: Option<(String, String)>,
    pub command: String,
    pub format: String,
}

impl CommandTopic {
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let mut segments = topic.split('/');
        if segments.next() != Some(ROOT) {
            return Err(TopicError::WrongRoot(topic.to_string()));
        }

        let rest: Vec<&str> = segments.collect();
        if rest.len() % 2 != 0 {
            return Err(TopicError::Unpaired(topic.to_string()));
        }

        let mut device_type = None;
        let mut device_id = None;
        let mut command = None;
        let mut format = None;

        for pair in rest.chunks(2) {
            let (marker, value) = (pair[0], pair[1]);
            let slot = match marker {
                "type" => &mut device_type,
                "id" => &mut device_id,
                "cmd" => &mut command,
                "fmt" => &mut format,
                other => {
                    return Err(TopicError::UnknownMarker {
                        topic: topic.to_string(),
                        marker: other.to_string(),
                    })
                }
            };
            if slot.is_some() {
                return Err(TopicError::DuplicateMarker {
                    topic: topic.to_string(),
                    marker: marker.to_string(),
                });
            }
            if value.is_empty() {
                return Err(TopicError::EmptyValue {
                    topic: topic.to_string(),
                    marker: marker.to_string(),
                });
            }
            *slot = Some(value.to_string());
        }

        let missing = |marker| TopicError::MissingMarker {
            topic: topic.to_string(),
            marker,
        };

        let command = command.ok_or_else(|| missing("cmd"))?;
        let format = format.ok_or_else(|| missing("fmt"))?;
        let device = match (device_type, device_id) {
            (Some(t), Some(i)) => Some((t, i)),
            (None, None) => None,
            (Some(_), None) => return Err(missing("id")),
            (None, Some(_)) => return Err(missing("type")),
        };

        Ok(Self {
            device,
            command,
            format,
        })
    }
}

/// `iot-2/evt/<event>/fmt/<format>`
pub fn device_event_topic(event: &str, format: &str) -> String {
    format!("{ROOT}/evt/{event}/fmt/{format}")
}

/// `iot-2/type/<T>/id/<I>/evt/<event>/fmt/<format>`
pub fn gateway_event_topic(device_type: &str, device_id: &str, event: &str, format: &str) -> String {
    format!("{ROOT}/type/{device_type}/id/{device_id}/evt/{event}/fmt/{format}")
}

/// Wildcard subscription for every command addressed to a device
pub fn device_command_filter() -> String {
    format!("{ROOT}/cmd/+/fmt/+")
}

/// Wildcard subscription for every command addressed to `type/id` through a
/// gateway
pub fn gateway_command_filter(device_type: &str, device_id: &str) -> String {
    format!("{ROOT}/type/{device_type}/id/{device_id}/cmd/+/fmt/+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gateway_command_topic() {
        let parsed = CommandTopic::parse("iot-2/type/raspi/id/pi1/cmd/reboot/fmt/json").unwrap();
        assert_eq!(parsed.device, Some(("raspi".to_string(), "pi1".to_string())));
        assert_eq!(parsed.command, "reboot");
        assert_eq!(parsed.format, "json");
    }

    #[test]
    fn parses_device_command_topic() {
        let parsed = CommandTopic::parse("iot-2/cmd/blink/fmt/text").unwrap();
        assert_eq!(parsed.device, None);
        assert_eq!(parsed.command, "blink");
        assert_eq!(parsed.format, "text");
    }

    #[test]
    fn rejects_malformed_topics() {
        assert!(matches!(
            CommandTopic::parse("iot-3/cmd/a/fmt/b"),
            Err(TopicError::WrongRoot(_))
        ));
        assert!(matches!(
            CommandTopic::parse("iot-2/cmd/a/fmt"),
            Err(TopicError::Unpaired(_))
        ));
        assert!(matches!(
            CommandTopic::parse("iot-2/cmd/a/evt/b"),
            Err(TopicError::UnknownMarker { marker, .. }) if marker == "evt"
        ));
        assert!(matches!(
            CommandTopic::parse("iot-2/cmd/a/cmd/b/fmt/c"),
            Err(TopicError::DuplicateMarker { .. })
        ));
        assert!(matches!(
            CommandTopic::parse("iot-2/cmd//fmt/json"),
            Err(TopicError::EmptyValue { marker, .. }) if marker == "cmd"
        ));
        assert!(matches!(
            CommandTopic::parse("iot-2/type/raspi/cmd/a/fmt/json"),
            Err(TopicError::MissingMarker { marker: "id", .. })
        ));
        assert!(matches!(
            CommandTopic::parse("iot-2/type/raspi/id/pi1/cmd/a"),
            Err(TopicError::MissingMarker { marker: "fmt", .. })
        ));
    }

    #[test]
    fn builds_event_and_command_topics() {
        assert_eq!(device_event_topic("status", "json"), "iot-2/evt/status/fmt/json");
        assert_eq!(
            gateway_event_topic("raspi", "pi1", "status", "json"),
            "iot-2/type/raspi/id/pi1/evt/status/fmt/json"
        );
        assert_eq!(device_command_filter(), "iot-2/cmd/+/fmt/+");
        assert_eq!(
            gateway_command_filter("gw", "gw1"),
            "iot-2/type/gw/id/gw1/cmd/+/fmt/+"
        );
    }
}
