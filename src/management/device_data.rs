//! Documents exchanged with the device management service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Timestamp format used by the platform, `2016-05-01T10:20:30Z`
pub const TIMESTAMP_FORMAT: &str = "%FT%TZ";

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Static description of a device, sent with the manage request
///
/// Empty fields are left out of the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_class: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fw_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hw_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub descriptive_location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(with = "platform_time", default = "Utc::now")]
    pub measured_date_time: DateTime<Utc>,
}

impl DeviceLocation {
    pub fn new(latitude: f64, longitude: f64, elevation: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
            accuracy: 0.0,
            measured_date_time: Utc::now(),
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    /// Moves the location and stamps it with the current time
    pub fn set_location(&mut self, latitude: f64, longitude: f64, elevation: f64) {
        self.latitude = latitude;
        self.longitude = longitude;
        self.elevation = elevation;
        self.measured_date_time = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LogSeverity {
    Informational,
    Warning,
    Error,
}

impl From<LogSeverity> for u8 {
    fn from(severity: LogSeverity) -> Self {
        match severity {
            LogSeverity::Informational => 0,
            LogSeverity::Warning => 1,
            LogSeverity::Error => 2,
        }
    }
}

impl TryFrom<u8> for LogSeverity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(LogSeverity::Informational),
            1 => Ok(LogSeverity::Warning),
            2 => Ok(LogSeverity::Error),
            other => Err(format!("unknown log severity {other}")),
        }
    }
}

/// Diagnostic log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLog {
    pub message: String,
    /// ISO 8601 time of the entry
    pub timestamp: String,
    pub severity: LogSeverity,
    /// Optional base64 encoded diagnostic data
    #[serde(default)]
    pub data: String,
}

impl DeviceLog {
    pub fn now(message: impl Into<String>, severity: LogSeverity) -> Self {
        Self {
            message: message.into(),
            timestamp: format_timestamp(&Utc::now()),
            severity,
            data: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FirmwareState {
    #[default]
    Idle,
    Downloading,
    Downloaded,
}

impl FirmwareState {
    pub fn code(self) -> i32 {
        match self {
            FirmwareState::Idle => 0,
            FirmwareState::Downloading => 1,
            FirmwareState::Downloaded => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStatus {
    Success,
    InProgress,
    OutOfMemory,
    ConnectionLost,
    VerificationFailed,
    UnsupportedImage,
    InvalidUrl,
    #[default]
    NotSet,
}

impl UpdateStatus {
    /// Protocol value, `None` for [`UpdateStatus::NotSet`]
    pub fn code(self) -> Option<i32> {
        match self {
            UpdateStatus::Success => Some(0),
            UpdateStatus::InProgress => Some(1),
            UpdateStatus::OutOfMemory => Some(2),
            UpdateStatus::ConnectionLost => Some(3),
            UpdateStatus::VerificationFailed => Some(4),
            UpdateStatus::UnsupportedImage => Some(5),
            UpdateStatus::InvalidUrl => Some(6),
            UpdateStatus::NotSet => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != UpdateStatus::InProgress
    }
}

/// Firmware offered by the platform and the progress of installing it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirmwareInfo {
    pub name: String,
    pub version: String,
    pub uri: String,
    pub verifier: String,
    pub state: FirmwareState,
    pub update_status: UpdateStatus,
    pub updated: Option<DateTime<Utc>>,
}

impl FirmwareInfo {
    /// Copies the offer out of a `mgmt.firmware` field value
    pub fn apply_offer(&mut self, value: &Value) {
        let text = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        self.name = text("name");
        self.version = text("version");
        self.uri = text("uri");
        self.verifier = text("verifier");
    }

    /// Marks the update finished, stamping the completion time on success
    pub fn set_update_status(&mut self, status: UpdateStatus) {
        self.update_status = status;
        if status == UpdateStatus::Success {
            self.updated = Some(Utc::now());
        }
    }

    /// `state`, `updateStatus` and `updatedDateTime` of a `mgmt.firmware`
    /// value
    ///
    /// Update fields are only written with `with_update`. `updateStatus` is
    /// left out while not set and `updatedDateTime` only follows a
    /// successful update.
    pub fn progress_json(&self, with_update: bool) -> Value {
        let mut doc = Map::new();
        doc.insert("state".to_string(), json!(self.state.code()));
        if with_update {
            if let Some(code) = self.update_status.code() {
                doc.insert("updateStatus".to_string(), json!(code));
            }
            if let (UpdateStatus::Success, Some(updated)) = (self.update_status, &self.updated) {
                doc.insert("updatedDateTime".to_string(), json!(format_timestamp(updated)));
            }
        }
        Value::Object(doc)
    }
}

/// Capabilities announced in the manage request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supports {
    pub device_actions: bool,
    pub firmware_actions: bool,
}

mod platform_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&at.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.is_empty() {
            return Ok(Utc::now());
        }
        NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
