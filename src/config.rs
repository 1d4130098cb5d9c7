//! Client configuration
//!
//! Two layers of configuration exist:
//!
//! - [`Properties`]: the identity and credentials of the device or gateway as
//!   issued by the platform. Loaded from TOML or from the platform's JSON
//!   device file; key names follow the platform (`Organization-ID`,
//!   `Device-Type`, ...).
//! - [`ClientSettings`]: engine tunables such as request and publish
//!   timeouts. They have sensible defaults and are rarely changed.
//!
//! Validation happens before any transport call is made, so a client that
//! was built successfully always has a usable identity.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

/// Organization that accepts anonymous devices without credentials or TLS
pub const QUICKSTART_ORG: &str = "quickstart";

/// Default platform domain
pub const DEFAULT_DOMAIN: &str = "internetofthings.ibmcloud.com";

/// Default secure MQTT port
pub const DEFAULT_PORT: u16 = 8883;

/// Plain MQTT port, always used by the quickstart organization
pub const QUICKSTART_PORT: u16 = 1883;

/// The only authentication method the platform accepts
pub const TOKEN_AUTH_METHOD: &str = "token";

/// Username sent to the broker when token authentication is used
pub const TOKEN_AUTH_USERNAME: &str = "use-token-auth";

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML document is malformed
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// The JSON document is malformed
    #[error("Failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A mandatory key is empty or absent
    #[error("{0} can not be empty")]
    MissingField(&'static str),

    /// Only token authentication is supported by the platform
    #[error("Unsupported authentication method '{0}', the platform supports \"token\"")]
    UnsupportedAuthMethod(String),

    /// Gateways need a registered organization
    #[error("Organization-ID can not be quickstart for a gateway")]
    QuickstartGateway,
}

/// Whether the client connects as a plain device or as a gateway
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    #[default]
    Device,
    Gateway,
}

impl ClientKind {
    /// Prefix of the MQTT client id
    pub fn client_id_prefix(&self) -> &'static str {
        match self {
            ClientKind::Device => "d",
            ClientKind::Gateway => "g",
        }
    }
}

/// Identity, credentials and TLS material of a device or gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Properties {
    #[serde(rename = "Organization-ID")]
    pub org_id: String,

    #[serde(rename = "Domain")]
    pub domain: String,

    #[serde(rename = "Device-Type")]
    pub device_type: String,

    #[serde(rename = "Device-ID")]
    pub device_id: String,

    #[serde(rename = "Authentication-Method")]
    pub auth_method: String,

    #[serde(rename = "Authentication-Token")]
    pub auth_token: String,

    /// PEM file with the CA certificates used to verify the broker
    #[serde(rename = "clientTrustStorePath")]
    pub trust_store: String,

    #[serde(rename = "useClientCertificates", deserialize_with = "flexible_bool")]
    pub use_client_certificates: bool,

    #[serde(rename = "clientCertPath")]
    pub client_cert: String,

    #[serde(rename = "clientKeyPath")]
    pub client_key: String,

    #[serde(rename = "clientKeyPassword")]
    pub client_key_password: String,

    #[serde(rename = "Port", deserialize_with = "flexible_port")]
    pub port: u16,

    /// MQTT keep-alive interval in seconds
    #[serde(rename = "Keep-Alive")]
    pub keep_alive_secs: u64,

    #[serde(rename = "Client-Kind")]
    pub kind: ClientKind,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            org_id: String::new(),
            domain: DEFAULT_DOMAIN.to_string(),
            device_type: String::new(),
            device_id: String::new(),
            auth_method: String::new(),
            auth_token: String::new(),
            trust_store: String::new(),
            use_client_certificates: false,
            client_cert: String::new(),
            client_key: String::new(),
            client_key_password: String::new(),
            port: DEFAULT_PORT,
            keep_alive_secs: 60,
            kind: ClientKind::Device,
        }
    }
}

impl Properties {
    /// Loads properties from a file
    ///
    /// Files ending in `.json` are read in the platform's JSON device file
    /// format, everything else is parsed as TOML.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading properties from {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn is_quickstart(&self) -> bool {
        self.org_id.eq_ignore_ascii_case(QUICKSTART_ORG)
    }

    /// Port actually used for the connection
    ///
    /// Quickstart only listens on the plain MQTT port.
    pub fn effective_port(&self) -> u16 {
        if self.is_quickstart() {
            QUICKSTART_PORT
        } else {
            self.port
        }
    }

    /// Broker host name, `<org>.messaging.<domain>`
    pub fn server_host(&self) -> String {
        format!("{}.messaging.{}", self.org_id, self.domain)
    }

    /// Broker URI for diagnostics
    pub fn server_uri(&self) -> String {
        let scheme = if self.is_quickstart() { "tcp" } else { "ssl" };
        format!("{}://{}:{}", scheme, self.server_host(), self.effective_port())
    }

    /// MQTT client id, `d:<org>:<type>:<id>` or `g:<org>:<type>:<id>`
    pub fn client_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind.client_id_prefix(),
            self.org_id,
            self.device_type,
            self.device_id
        )
    }

    /// Checks that the properties describe a connectable client
    ///
    /// Rejects what the platform would refuse anyway: empty identity fields,
    /// an auth method other than `token`, a gateway in the quickstart
    /// organization, a registered device without trust store, and
    /// half-configured client certificates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let result = self.check();
        if let Err(e) = &result {
            error!("Rejected properties for {}: {}", self.client_id(), e);
        }
        result
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.org_id.is_empty() {
            return Err(ConfigError::MissingField("Organization-ID"));
        }
        if self.kind == ClientKind::Gateway && self.is_quickstart() {
            return Err(ConfigError::QuickstartGateway);
        }
        if self.domain.is_empty() {
            return Err(ConfigError::MissingField("Domain"));
        }
        if self.device_type.is_empty() {
            return Err(ConfigError::MissingField("Device-Type"));
        }
        if self.device_id.is_empty() {
            return Err(ConfigError::MissingField("Device-ID"));
        }

        if self.is_quickstart() {
            return Ok(());
        }

        if self.auth_method != TOKEN_AUTH_METHOD {
            return Err(ConfigError::UnsupportedAuthMethod(self.auth_method.clone()));
        }
        if self.auth_token.is_empty() {
            return Err(ConfigError::MissingField("Authentication-Token"));
        }
        if self.trust_store.is_empty() {
            return Err(ConfigError::MissingField("clientTrustStorePath"));
        }
        if self.use_client_certificates {
            if self.client_cert.is_empty() {
                return Err(ConfigError::MissingField("clientCertPath"));
            }
            if self.client_key.is_empty() {
                return Err(ConfigError::MissingField("clientKeyPath"));
            }
        }
        Ok(())
    }
}

/// Engine tunables
///
/// All durations are stored in milliseconds so the struct maps one-to-one
/// onto a TOML table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// How long a management request waits for the platform's response
    pub request_timeout_ms: u64,

    /// Idle wake-up interval of the reply dispatcher loop
    pub reply_poll_interval_ms: u64,

    /// How long a single publish may take before it counts as failed
    pub publish_timeout_ms: u64,

    /// How long subscribe and unsubscribe may take
    pub subscribe_timeout_ms: u64,

    /// How long to wait for the broker to accept the connection
    pub connect_timeout_ms: u64,

    /// Whether `unmanage` waits for the platform to acknowledge
    ///
    /// When false, having transmitted the request counts as success.
    pub unmanage_requires_ack: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            reply_poll_interval_ms: 10_000,
            publish_timeout_ms: 10_000,
            subscribe_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            unmanage_requires_ack: false,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reply_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reply_poll_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// The platform's JSON device files carry booleans and ports as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum BoolOrString {
    Bool(bool),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortOrString {
    Number(u16),
    Text(String),
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(value) => Ok(value),
        BoolOrString::Text(text) => Ok(text.trim().eq_ignore_ascii_case("true")),
    }
}

fn flexible_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    match PortOrString::deserialize(deserializer)? {
        PortOrString::Number(port) => Ok(port),
        PortOrString::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> Properties {
        Properties {
            org_id: "abc123".to_string(),
            device_type: "raspi".to_string(),
            device_id: "pi1".to_string(),
            auth_method: "token".to_string(),
            auth_token: "secret".to_string(),
            trust_store: "/etc/iotp/ca.pem".to_string(),
            ..Properties::default()
        }
    }

    #[test]
    fn parses_platform_json_with_string_values() {
        let json = r#"{
            "Organization-ID": "abc123",
            "Device-Type": "raspi",
            "Device-ID": "pi1",
            "Authentication-Method": "token",
            "Authentication-Token": "secret",
            "clientTrustStorePath": "/etc/iotp/ca.pem",
            "useClientCertificates": "false",
            "Port": "443"
        }"#;

        let props = Properties::from_json_str(json).unwrap();
        assert_eq!(props.port, 443);
        assert!(!props.use_client_certificates);
        assert_eq!(props.domain, DEFAULT_DOMAIN);
        assert!(props.validate().is_ok());
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
            Organization-ID = "abc123"
            Device-Type = "gw"
            Device-ID = "gw1"
            Authentication-Method = "token"
            Authentication-Token = "secret"
            clientTrustStorePath = "/etc/iotp/ca.pem"
            Client-Kind = "gateway"
            Port = 8883
        "#;

        let props = Properties::from_toml_str(toml).unwrap();
        assert_eq!(props.kind, ClientKind::Gateway);
        assert_eq!(props.client_id(), "g:abc123:gw:gw1");
        assert_eq!(props.keep_alive_secs, 60);
    }

    #[test]
    fn derives_connection_values() {
        let props = registered();
        assert_eq!(props.client_id(), "d:abc123:raspi:pi1");
        assert_eq!(
            props.server_uri(),
            "ssl://abc123.messaging.internetofthings.ibmcloud.com:8883"
        );

        let quickstart = Properties {
            org_id: "quickstart".to_string(),
            port: 8883,
            ..registered()
        };
        assert_eq!(quickstart.effective_port(), QUICKSTART_PORT);
        assert!(quickstart.server_uri().starts_with("tcp://"));
    }

    #[test]
    fn rejects_wrong_auth_method() {
        let props = Properties {
            auth_method: "apikey".to_string(),
            ..registered()
        };
        assert!(matches!(
            props.validate(),
            Err(ConfigError::UnsupportedAuthMethod(method)) if method == "apikey"
        ));
    }

    #[test]
    fn rejects_quickstart_gateway_in_any_case() {
        let props = Properties {
            org_id: "QuickStart".to_string(),
            kind: ClientKind::Gateway,
            ..registered()
        };
        assert!(matches!(props.validate(), Err(ConfigError::QuickstartGateway)));
    }

    #[test]
    fn quickstart_device_needs_no_credentials() {
        let props = Properties {
            org_id: "quickstart".to_string(),
            device_type: "sensor".to_string(),
            device_id: "s1".to_string(),
            ..Properties::default()
        };
        assert!(props.validate().is_ok());
    }

    #[test]
    fn registered_device_needs_trust_store_and_cert_paths() {
        let props = Properties {
            trust_store: String::new(),
            ..registered()
        };
        assert!(matches!(
            props.validate(),
            Err(ConfigError::MissingField("clientTrustStorePath"))
        ));

        let props = Properties {
            use_client_certificates: true,
            client_cert: "/etc/iotp/cert.pem".to_string(),
            ..registered()
        };
        assert!(matches!(
            props.validate(),
            Err(ConfigError::MissingField("clientKeyPath"))
        ));
    }

    #[test]
    fn settings_defaults() {
        let settings: ClientSettings = toml::from_str("publish_timeout_ms = 500").unwrap();
        assert_eq!(settings.publish_timeout(), Duration::from_millis(500));
        assert_eq!(settings.request_timeout(), Duration::from_secs(10));
        assert!(!settings.unmanage_requires_ack);
    }
}
