use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration, Transport as WireTransport};
use tracing::{debug, info};

use super::TransportError;
use crate::config::{Properties, TOKEN_AUTH_USERNAME};

/// Connection options for one device or gateway
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    /// `(username, password)`, absent for quickstart
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub tls: Option<TlsPaths>,
    /// Capacity of the rumqttc request channel
    pub channel_capacity: usize,
}

/// Filesystem locations of the TLS material
#[derive(Debug, Clone, PartialEq)]
pub struct TlsPaths {
    pub ca: String,
    /// `(certificate, key)` when client certificates are used
    pub client_auth: Option<(String, String)>,
    pub key_password: String,
}

impl MqttConfig {
    /// Derives connection options from validated properties
    pub fn from_properties(props: &Properties) -> Self {
        let quickstart = props.is_quickstart();

        let credentials = if quickstart {
            None
        } else {
            Some((TOKEN_AUTH_USERNAME.to_string(), props.auth_token.clone()))
        };

        let tls = if quickstart {
            None
        } else {
            let client_auth = props
                .use_client_certificates
                .then(|| (props.client_cert.clone(), props.client_key.clone()));
            Some(TlsPaths {
                ca: props.trust_store.clone(),
                client_auth,
                key_password: props.client_key_password.clone(),
            })
        };

        Self {
            client_id: props.client_id(),
            host: props.server_host(),
            port: props.effective_port(),
            credentials,
            keep_alive: Duration::from_secs(props.keep_alive_secs),
            tls,
            channel_capacity: 100,
        }
    }

    /// Builds the rumqttc options, reading TLS material from disk
    pub async fn to_mqtt_options(&self) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);

        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }

        if let Some(tls) = &self.tls {
            options.set_transport(WireTransport::Tls(tls.load().await?));
            debug!("TLS enabled with trust store {}", tls.ca);
        }

        info!(
            "MQTT options prepared for {} at {}:{}",
            self.client_id, self.host, self.port
        );
        Ok(options)
    }
}

impl TlsPaths {
    async fn load(&self) -> Result<TlsConfiguration, TransportError> {
        if !self.key_password.is_empty() {
            return Err(TransportError::Tls(
                "encrypted client keys are not supported, provide an unencrypted PEM key".to_string(),
            ));
        }

        let ca = tokio::fs::read(&self.ca).await?;
        let client_auth = match &self.client_auth {
            Some((cert, key)) => Some((tokio::fs::read(cert).await?, tokio::fs::read(key).await?)),
            None => None,
        };

        Ok(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        })
    }
}
