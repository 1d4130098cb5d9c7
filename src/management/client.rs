//! Managed device and gateway client
//!
//! Wires the engine together and runs the device management handshake:
//!
//! ```text
//!                 ┌──────────── SharedRegistry ◄─────────────┐
//!                 ▼                                          │
//! MqttHandler ──► CallbackRouter ──► handlers ──► ReplyQueue ──► ReplyDispatcher ──► Transport
//!                        │                                           ▲
//!                        └──► ResponseCorrelator ◄── manage/unmanage ┘ (direct publish)
//! ```

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Span};

use super::action::{DeviceActionHandler, DeviceActions};
use super::attribute::{AttributeActions, AttributeHandler};
use super::device_data::{DeviceInfo, DeviceLocation, DeviceLog, Supports};
use super::firmware::{FirmwareActions, FirmwareHandler};
use super::response::RC_OK;
use crate::config::{ClientKind, ClientSettings, Properties};
use crate::correlation::ResponseCorrelator;
use crate::dispatch::{DispatcherSettings, ReplyDispatcher, Running};
use crate::error::ClientError;
use crate::mqtt::config::MqttConfig;
use crate::mqtt::mqtt_handler::MqttHandler;
use crate::mqtt::{qos_level, with_timeout, QoS, Transport, TransportError};
use crate::routing::topic::{
    device_command_filter, device_event_topic, gateway_command_filter, gateway_event_topic,
    ADD_ERROR_CODES_TOPIC, ADD_LOG_TOPIC, CLEAR_ERROR_CODES_TOPIC, CLEAR_LOG_TOPIC,
    LOCATION_UPDATE_TOPIC, MANAGE_TOPIC, RESPONSE_TOPIC, UNMANAGE_TOPIC,
};
use crate::routing::{CallbackRouter, CommandCallback, HandlerRef, RouterStats, SharedRegistry};

/// Device-side implementations of the management actions
///
/// Absent hooks are neither announced in the manage request nor subscribed.
#[derive(Clone, Default)]
pub struct ManagementHooks {
    pub actions: Option<Arc<dyn DeviceActions>>,
    pub firmware: Option<Arc<dyn FirmwareActions>>,
    pub attributes: Option<Arc<dyn AttributeActions>>,
}

struct ManagementHandlers {
    firmware: Option<Arc<FirmwareHandler>>,
    action: Option<Arc<DeviceActionHandler>>,
    attribute: Option<Arc<AttributeHandler>>,
}

impl ManagementHandlers {
    /// Topic bindings activated by a successful manage request
    fn bindings(&self) -> Vec<(&'static str, HandlerRef)> {
        let mut bindings: Vec<(&'static str, HandlerRef)> = Vec::new();
        if let Some(firmware) = &self.firmware {
            let handler: HandlerRef = firmware.clone();
            for topic in FirmwareHandler::topics() {
                bindings.push((topic, handler.clone()));
            }
        }
        if let Some(action) = &self.action {
            let handler: HandlerRef = action.clone();
            for topic in DeviceActionHandler::topics() {
                bindings.push((topic, handler.clone()));
            }
        }
        if let Some(attribute) = &self.attribute {
            let handler: HandlerRef = attribute.clone();
            for topic in AttributeHandler::topics() {
                bindings.push((topic, handler.clone()));
            }
        }
        bindings
    }
}

fn response_code(response: Option<&Value>) -> Option<i64> {
    response?.get("rc")?.as_i64()
}

/// Device or gateway session with the platform
pub struct ManagedClient {
    properties: Properties,
    settings: ClientSettings,
    transport: Arc<dyn Transport>,
    registry: SharedRegistry,
    router: Arc<CallbackRouter>,
    correlator: Arc<ResponseCorrelator>,
    handlers: ManagementHandlers,
    dispatcher: Mutex<Option<ReplyDispatcher<Running>>>,
    // serializes manage and unmanage
    handshake: Mutex<()>,
    // held across registry check, transport call and registry write
    subscriptions: Mutex<()>,
    command_topic: String,
    span: Span,
}

impl ManagedClient {
    /// Validates the properties, connects to the broker and subscribes to
    /// the command topic
    pub async fn connect(
        properties: Properties,
        settings: ClientSettings,
        hooks: ManagementHooks,
    ) -> Result<Self, ClientError> {
        let config = MqttConfig::from_properties(&properties);
        let connect_timeout = settings.connect_timeout();

        Self::start(properties, settings, hooks, move |router, span| async move {
            let handler = MqttHandler::connect(&config, router, connect_timeout, span).await?;
            Ok::<_, TransportError>(Arc::new(handler) as Arc<dyn Transport>)
        })
        .await
    }

    /// Like [`connect`](Self::connect) with a caller supplied transport
    ///
    /// `connect` receives the router that inbound messages must be fed to.
    pub async fn start<F, Fut>(
        properties: Properties,
        settings: ClientSettings,
        hooks: ManagementHooks,
        connect: F,
    ) -> Result<Self, ClientError>
    where
        F: FnOnce(Arc<CallbackRouter>, Span) -> Fut,
        Fut: Future<Output = Result<Arc<dyn Transport>, TransportError>>,
    {
        properties.validate()?;

        let span = info_span!("iotp", client = %properties.client_id());
        info!(
            parent: &span,
            "Starting {:?} client for {}",
            properties.kind,
            properties.server_uri()
        );

        let registry = SharedRegistry::new();
        let (dispatcher, replies) = ReplyDispatcher::create(
            Some(DispatcherSettings::from(&settings)),
            info_span!(parent: &span, "dispatcher"),
        );
        let identity = Some((properties.device_type.clone(), properties.device_id.clone()));
        let router = Arc::new(CallbackRouter::new(
            registry.clone(),
            replies.clone(),
            identity,
            info_span!(parent: &span, "router"),
        ));

        let transport = connect(router.clone(), span.clone()).await?;
        let dispatcher = dispatcher.start(transport.clone());
        let correlator = Arc::new(ResponseCorrelator::new(
            transport.clone(),
            settings.publish_timeout(),
            info_span!(parent: &span, "correlator"),
        ));

        let handlers = ManagementHandlers {
            firmware: hooks.firmware.map(|actions| {
                Arc::new(FirmwareHandler::new(
                    actions,
                    replies.clone(),
                    info_span!(parent: &span, "firmware"),
                ))
            }),
            action: hooks.actions.map(|actions| {
                Arc::new(DeviceActionHandler::new(
                    actions,
                    info_span!(parent: &span, "device-action"),
                ))
            }),
            attribute: hooks.attributes.map(|actions| {
                Arc::new(AttributeHandler::new(
                    actions,
                    info_span!(parent: &span, "attribute-update"),
                ))
            }),
        };

        let command_topic = match properties.kind {
            ClientKind::Device => device_command_filter(),
            ClientKind::Gateway => {
                gateway_command_filter(&properties.device_type, &properties.device_id)
            }
        };

        let client = Self {
            properties,
            settings,
            transport,
            registry,
            router,
            correlator,
            handlers,
            dispatcher: Mutex::new(Some(dispatcher)),
            handshake: Mutex::new(()),
            subscriptions: Mutex::new(()),
            command_topic,
            span,
        };

        if !client.properties.is_quickstart() {
            if let Err(e) = client.subscribe_commands().await {
                warn!(parent: &client.span, "Command subscription failed: {}", e);
                if let Err(e) = client.disconnect().await {
                    warn!(parent: &client.span, "Cleanup after failed start: {}", e);
                }
                return Err(e);
            }
        }

        info!(parent: &client.span, "Client ready");
        Ok(client)
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn firmware(&self) -> Option<&Arc<FirmwareHandler>> {
        self.handlers.firmware.as_ref()
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Capabilities backed by the configured hooks
    pub fn supports(&self) -> Supports {
        Supports {
            device_actions: self.handlers.action.is_some(),
            firmware_actions: self.handlers.firmware.is_some(),
        }
    }

    pub fn set_command_callback(&self, callback: impl CommandCallback + 'static) {
        self.router.set_command_callback(Arc::new(callback));
    }

    async fn transport_subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        with_timeout(
            "subscribe",
            topic,
            self.settings.subscribe_timeout(),
            self.transport.subscribe(topic, qos),
        )
        .await
    }

    async fn transport_unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        with_timeout(
            "unsubscribe",
            topic,
            self.settings.subscribe_timeout(),
            self.transport.unsubscribe(topic),
        )
        .await
    }

    /// Subscribes to a plain topic, a no-op when already subscribed
    pub async fn subscribe_topic(&self, topic: &str, qos: u8) -> Result<bool, ClientError> {
        let _subscriptions = self.subscriptions.lock().await;
        let listed = self.registry.read().contains(topic);
        if listed {
            debug!(parent: &self.span, "Already subscribed to {}", topic);
            return Ok(true);
        }

        self.transport_subscribe(topic, qos_level(qos)?).await?;
        self.registry.write().add(topic);
        debug!(parent: &self.span, "Subscribed to {}", topic);
        Ok(true)
    }

    /// Binds a handler to a topic, subscribing the topic if needed
    pub async fn subscribe_command_handler(
        &self,
        topic: &str,
        handler: HandlerRef,
    ) -> Result<bool, ClientError> {
        let _subscriptions = self.subscriptions.lock().await;
        let (bound, listed) = {
            let registry = self.registry.read();
            (registry.contains_handler(topic, &handler), registry.contains(topic))
        };
        if bound {
            debug!(parent: &self.span, "{} already bound to {}", handler.name(), topic);
            return Ok(true);
        }

        if !listed {
            self.transport_subscribe(topic, QoS::AtLeastOnce).await?;
        }
        debug!(parent: &self.span, "Binding {} to {}", handler.name(), topic);
        self.registry.write().add_handler(topic, handler);
        Ok(true)
    }

    /// Unbinds a handler, unsubscribing the topic once nothing else uses it
    pub async fn unsubscribe_command_handler(
        &self,
        topic: &str,
        handler: &HandlerRef,
    ) -> Result<bool, ClientError> {
        let _subscriptions = self.subscriptions.lock().await;
        let still_listed = {
            let mut registry = self.registry.write();
            if !registry.remove_handler(topic, handler) {
                return Ok(false);
            }
            registry.contains(topic)
        };

        if !still_listed {
            self.transport_unsubscribe(topic).await?;
        }
        debug!(parent: &self.span, "Unbound {} from {}", handler.name(), topic);
        Ok(true)
    }

    /// Unsubscribes a topic and drops every handler bound to it
    pub async fn unsubscribe_commands(&self, topic: &str) -> Result<bool, ClientError> {
        let _subscriptions = self.subscriptions.lock().await;
        let listed = self.registry.read().contains(topic);
        if !listed {
            return Ok(false);
        }

        self.transport_unsubscribe(topic).await?;
        self.registry.write().remove_topic(topic);
        debug!(parent: &self.span, "Unsubscribed from {}", topic);
        Ok(true)
    }

    /// Subscribes to every command addressed to this client
    pub async fn subscribe_commands(&self) -> Result<bool, ClientError> {
        let topic = self.command_topic.clone();
        self.subscribe_topic(&topic, 1).await
    }

    fn require_gateway(&self, operation: &str) -> Result<(), ClientError> {
        match self.properties.kind {
            ClientKind::Gateway => Ok(()),
            ClientKind::Device => Err(ClientError::Unsupported(format!(
                "{operation} is only available to gateways"
            ))),
        }
    }

    /// Subscribes to the commands of a device attached to this gateway
    pub async fn subscribe_device_commands(
        &self,
        device_type: &str,
        device_id: &str,
    ) -> Result<bool, ClientError> {
        self.require_gateway("subscribe_device_commands")?;
        self.subscribe_topic(&gateway_command_filter(device_type, device_id), 1)
            .await
    }

    pub async fn unsubscribe_device_commands(
        &self,
        device_type: &str,
        device_id: &str,
    ) -> Result<bool, ClientError> {
        self.require_gateway("unsubscribe_device_commands")?;
        self.unsubscribe_commands(&gateway_command_filter(device_type, device_id))
            .await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), ClientError> {
        let qos = qos_level(qos)?;
        debug!(parent: &self.span, "Publishing {} bytes to {}", payload.len(), topic);
        with_timeout(
            "publish",
            topic,
            self.settings.publish_timeout(),
            self.transport.publish(topic, payload, qos),
        )
        .await?;
        Ok(())
    }

    /// Publishes an event of this device or gateway
    pub async fn publish_event(
        &self,
        event: &str,
        format: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
    ) -> Result<(), ClientError> {
        let topic = match self.properties.kind {
            ClientKind::Device => device_event_topic(event, format),
            ClientKind::Gateway => gateway_event_topic(
                &self.properties.device_type,
                &self.properties.device_id,
                event,
                format,
            ),
        };
        self.publish(&topic, payload.into(), qos).await
    }

    /// Publishes an event on behalf of a device attached to this gateway
    pub async fn publish_device_event(
        &self,
        device_type: &str,
        device_id: &str,
        event: &str,
        format: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
    ) -> Result<(), ClientError> {
        self.require_gateway("publish_device_event")?;
        let topic = gateway_event_topic(device_type, device_id, event, format);
        self.publish(&topic, payload.into(), qos).await
    }

    async fn bind_response_handler(&self) -> Result<bool, ClientError> {
        self.subscribe_command_handler(RESPONSE_TOPIC, self.correlator.clone())
            .await
    }

    /// Registers the device with the management service
    ///
    /// Returns true when the platform answered with rc 200, after the
    /// firmware, action and attribute handlers were subscribed. Any other
    /// answer, or none within the request timeout, returns false and leaves
    /// those handlers unsubscribed.
    pub async fn manage(
        &self,
        lifetime: u64,
        supports: Supports,
        device_info: &DeviceInfo,
    ) -> Result<bool, ClientError> {
        let _handshake = self.handshake.lock().await;
        self.bind_response_handler().await?;

        let data = json!({
            "lifetime": lifetime,
            "supports": serde_json::to_value(supports)?,
            "deviceInfo": serde_json::to_value(device_info)?,
        });
        let response = self
            .correlator
            .send_and_wait(
                MANAGE_TOPIC,
                Some(data),
                QoS::AtLeastOnce,
                self.settings.request_timeout(),
            )
            .await?;

        let rc = response_code(response.as_ref());
        if rc != Some(i64::from(RC_OK)) {
            warn!(parent: &self.span, "Manage request rejected, rc {:?}", rc);
            return Ok(false);
        }

        for (topic, handler) in self.handlers.bindings() {
            self.subscribe_command_handler(topic, handler).await?;
        }
        info!(parent: &self.span, "Device is managed, lifetime {}s", lifetime);
        Ok(true)
    }

    /// Deregisters the device from the management service
    ///
    /// Unless `unmanage_requires_ack` is set, a transmitted request counts as
    /// success. The response handler and the management handlers are
    /// unbound either way.
    pub async fn unmanage(&self) -> Result<bool, ClientError> {
        let _handshake = self.handshake.lock().await;

        let success = if self.settings.unmanage_requires_ack {
            self.bind_response_handler().await?;
            let response = self
                .correlator
                .send_and_wait(
                    UNMANAGE_TOPIC,
                    None,
                    QoS::AtLeastOnce,
                    self.settings.request_timeout(),
                )
                .await?;
            response_code(response.as_ref()) == Some(i64::from(RC_OK))
        } else {
            self.correlator
                .send(UNMANAGE_TOPIC, None, QoS::AtLeastOnce)
                .await?;
            true
        };

        let response_handler: HandlerRef = self.correlator.clone();
        self.unsubscribe_command_handler(RESPONSE_TOPIC, &response_handler)
            .await?;
        for (topic, handler) in self.handlers.bindings() {
            self.unsubscribe_command_handler(topic, &handler).await?;
        }

        info!(parent: &self.span, "Unmanage finished, success: {}", success);
        Ok(success)
    }

    /// Sends a management request and checks for rc 200
    pub async fn push_management_update(
        &self,
        topic: &str,
        data: Option<Value>,
    ) -> Result<bool, ClientError> {
        self.bind_response_handler().await?;
        let response = self
            .correlator
            .send_and_wait(topic, data, QoS::AtLeastOnce, self.settings.request_timeout())
            .await?;

        let rc = response_code(response.as_ref());
        if rc != Some(i64::from(RC_OK)) {
            warn!(parent: &self.span, "Update on {} answered with rc {:?}", topic, rc);
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn update_location(&self, location: &DeviceLocation) -> Result<bool, ClientError> {
        let data = serde_json::to_value(location)?;
        self.push_management_update(LOCATION_UPDATE_TOPIC, Some(data))
            .await
    }

    pub async fn add_error_code(&self, code: i32) -> Result<bool, ClientError> {
        self.push_management_update(ADD_ERROR_CODES_TOPIC, Some(json!({ "errorCode": code })))
            .await
    }

    pub async fn clear_error_codes(&self) -> Result<bool, ClientError> {
        self.push_management_update(CLEAR_ERROR_CODES_TOPIC, None)
            .await
    }

    pub async fn add_log(&self, log: &DeviceLog) -> Result<bool, ClientError> {
        let data = serde_json::to_value(log)?;
        self.push_management_update(ADD_LOG_TOPIC, Some(data)).await
    }

    pub async fn clear_logs(&self) -> Result<bool, ClientError> {
        self.push_management_update(CLEAR_LOG_TOPIC, None).await
    }

    /// Tears the session down
    ///
    /// Unsubscribes the command topic, stops firmware progress reporting,
    /// joins the reply dispatcher and disconnects the transport. Calling it
    /// again only repeats the transport disconnect.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        info!(parent: &self.span, "Disconnecting");

        let topic = self.command_topic.clone();
        if let Err(e) = self.unsubscribe_commands(&topic).await {
            warn!(parent: &self.span, "Unsubscribing {} failed: {}", topic, e);
        }

        if let Some(firmware) = &self.handlers.firmware {
            firmware.shutdown().await;
        }

        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            let stats = dispatcher.shutdown().await.stats();
            debug!(parent: &self.span, "Reply dispatcher stats: {:?}", stats);
        }

        self.transport.disconnect().await?;
        info!(parent: &self.span, "Disconnected");
        Ok(())
    }
}
