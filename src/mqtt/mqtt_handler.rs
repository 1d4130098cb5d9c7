use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Span};

use super::config::MqttConfig;
use super::{Transport, TransportError};
use crate::routing::CallbackRouter;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

type SharedStatus = Arc<Mutex<MqttStatus>>;

fn with_status<R>(status: &SharedStatus, f: impl FnOnce(&mut MqttStatus) -> R) -> R {
    let mut guard = status.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// rumqttc-backed [`Transport`]
///
/// Owns the async client and the task that drives the rumqttc event loop.
/// Inbound publishes are handed to the [`CallbackRouter`] on that task, in
/// delivery order.
pub struct MqttHandler {
    client: AsyncClient,
    status: SharedStatus,
    driver: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl MqttHandler {
    /// Connects to the broker and waits for the connection to be accepted
    pub async fn connect(
        config: &MqttConfig,
        router: Arc<CallbackRouter>,
        connect_timeout: Duration,
        span: Span,
    ) -> Result<Self, TransportError> {
        let options = config.to_mqtt_options().await?;
        let (client, event_loop) = AsyncClient::new(options, config.channel_capacity);

        let status = SharedStatus::default();
        with_status(&status, |s| s.connection_state = ConnectionState::Connecting);

        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = spawn_event_loop(event_loop, router, status.clone(), ready_tx, span.clone());
        info!(parent: &span, "MQTT event loop spawned for {}", config.client_id);

        let outcome = match tokio::time::timeout(connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                operation: "connect",
                topic: format!("{}:{}", config.host, config.port),
            }),
        };

        if let Err(e) = outcome {
            error!(parent: &span, "Connection to {}:{} failed: {}", config.host, config.port, e);
            driver.abort();
            with_status(&status, |s| {
                s.connection_state = ConnectionState::Failed;
                s.error_messages.push(e.to_string());
            });
            return Err(e);
        }

        info!(parent: &span, "Connected to {}:{}", config.host, config.port);
        Ok(Self {
            client,
            status,
            driver: Mutex::new(Some(driver)),
            span,
        })
    }

    pub fn status(&self) -> MqttStatus {
        with_status(&self.status, |s| s.clone())
    }

    pub fn is_connected(&self) -> bool {
        with_status(&self.status, |s| s.connection_state == ConnectionState::Connected)
    }
}

fn spawn_event_loop(
    mut event_loop: EventLoop,
    router: Arc<CallbackRouter>,
    status: SharedStatus,
    ready: oneshot::Sender<Result<(), TransportError>>,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ready = Some(ready);
        debug!(parent: &span, "MQTT event loop started");

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    let result = if ack.code == ConnectReturnCode::Success {
                        with_status(&status, |s| s.connection_state = ConnectionState::Connected);
                        Ok(())
                    } else {
                        Err(TransportError::Connection(format!("{:?}", ack.code)))
                    };
                    let refused = result.is_err();
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(result);
                    }
                    if refused {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    with_status(&status, |s| {
                        s.messages_received += 1;
                        s.last_activity = Some(Local::now());
                    });
                    router.on_message(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    router.delivery_complete(ack.pkid);
                }
                Ok(Event::Incoming(packet)) => {
                    debug!(parent: &span, "Received other MQTT packet: {:?}", packet);
                }
                Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                    with_status(&status, |s| {
                        s.messages_sent += 1;
                        s.last_activity = Some(Local::now());
                    });
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!(parent: &span, "Disconnect sent, stopping event loop");
                    with_status(&status, |s| s.connection_state = ConnectionState::Disconnected);
                    break;
                }
                Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    let cause = e.to_string();
                    with_status(&status, |s| {
                        s.connection_state = ConnectionState::Failed;
                        s.error_messages.push(cause.clone());
                    });
                    match ready.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(TransportError::Connection(cause)));
                        }
                        None => router.connection_lost(&cause),
                    }
                    break;
                }
            }
        }

        debug!(parent: &span, "MQTT event loop stopped");
    })
}

#[async_trait]
impl Transport for MqttHandler {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        debug!(parent: &self.span, "Publishing {} bytes to {}", payload.len(), topic);
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        debug!(parent: &self.span, "Subscribing to {}", topic);
        self.client.subscribe(topic, qos).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        debug!(parent: &self.span, "Unsubscribing from {}", topic);
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(driver) = driver else {
            warn!(parent: &self.span, "Disconnect called but the event loop is not running");
            return Ok(());
        };

        if let Err(e) = self.client.disconnect().await {
            warn!(parent: &self.span, "MQTT client disconnect error: {}", e);
            driver.abort();
        }
        if let Err(e) = driver.await {
            if !e.is_cancelled() {
                error!(parent: &self.span, "MQTT event loop task failed: {}", e);
            }
        }

        with_status(&self.status, |s| s.connection_state = ConnectionState::Disconnected);
        info!(parent: &self.span, "MQTT client disconnected");
        Ok(())
    }
}
