use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn, Span};

use crate::mqtt::message_manager::ReplyMessage;
use crate::mqtt::{with_timeout, QoS, Transport, TransportError};
use crate::routing::MessageHandler;

/// Field carrying the correlation id in requests and responses
pub const REQUEST_ID_FIELD: &str = "reqId";

/// Matches control-plane responses to the requests that caused them
///
/// Each request gets a fresh id that is registered as pending before the
/// request leaves. Responses for pending ids are stored and every waiter is
/// woken; a waiter only returns once its own id has a response or its
/// deadline passed. Responses for unknown ids are dropped.
pub struct ResponseCorrelator {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<String, Option<Value>>>,
    arrivals: Notify,
    counter: AtomicU64,
    publish_timeout: Duration,
    span: Span,
}

impl ResponseCorrelator {
    pub fn new(transport: Arc<dyn Transport>, publish_timeout: Duration, span: Span) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
            counter: AtomicU64::new(0),
            publish_timeout,
            span,
        }
    }

    /// Returns an id never handed out before in this process
    ///
    /// The wall-clock prefix keeps ids from colliding with those of an
    /// earlier run of the same device.
    pub fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", Utc::now().timestamp_millis(), n)
    }

    /// Sends a request and waits for the matching response
    ///
    /// Returns `Ok(None)` when no response arrived within `timeout`. The
    /// pending entry is removed either way.
    pub async fn send_and_wait(
        &self,
        topic: &str,
        data: Option<Value>,
        qos: QoS,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError> {
        let req_id = self.next_request_id();
        self.lock().insert(req_id.clone(), None);

        if let Err(e) = self.publish_request(topic, data, &req_id, qos).await {
            self.lock().remove(&req_id);
            return Err(e);
        }

        let response = self.wait_for_response(&req_id, timeout).await;
        match &response {
            Some(doc) => debug!(parent: &self.span, "Response for {}: {}", req_id, doc),
            None => warn!(parent: &self.span, "No response for {} on {} within {:?}", req_id, topic, timeout),
        }
        Ok(response)
    }

    /// Sends a request without waiting for a response
    pub async fn send(&self, topic: &str, data: Option<Value>, qos: QoS) -> Result<String, TransportError> {
        let req_id = self.next_request_id();
        self.publish_request(topic, data, &req_id, qos).await?;
        Ok(req_id)
    }

    async fn publish_request(
        &self,
        topic: &str,
        data: Option<Value>,
        req_id: &str,
        qos: QoS,
    ) -> Result<(), TransportError> {
        let envelope = request_envelope(data, req_id);
        debug!(parent: &self.span, "Sending request {} on {}", req_id, topic);
        with_timeout(
            "publish",
            topic,
            self.publish_timeout,
            self.transport.publish(topic, envelope.to_string().into_bytes(), qos),
        )
        .await
    }

    /// Waits until a response for `req_id` is recorded or `timeout` elapses
    ///
    /// Unknown ids return `None` immediately. The entry is consumed in both
    /// outcomes, so a second wait on the same id also returns `None` at once.
    pub async fn wait_for_response(&self, req_id: &str, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so an arrival between the
            // check and the await is not missed
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut pending = self.lock();
                match pending.get(req_id).map(Option::is_some) {
                    None => return None,
                    Some(true) => return pending.remove(req_id).flatten(),
                    Some(false) => {}
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().remove(req_id).flatten();
            }
        }
    }

    /// Stores a response for a pending request and wakes all waiters
    ///
    /// Returns false when no request with this id is pending.
    pub fn record_response(&self, req_id: &str, document: Value) -> bool {
        {
            let mut pending = self.lock();
            match pending.get_mut(req_id) {
                Some(slot) => *slot = Some(document),
                None => {
                    debug!(parent: &self.span, "Ignoring response for unknown request {}", req_id);
                    return false;
                }
            }
        }
        self.arrivals.notify_waiters();
        true
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageHandler for ResponseCorrelator {
    fn name(&self) -> &str {
        "response-correlator"
    }

    fn on_document(&self, topic: &str, document: &Value) -> Option<ReplyMessage> {
        match document.get(REQUEST_ID_FIELD).and_then(Value::as_str) {
            Some(req_id) => {
                let rc = document.get("rc").unwrap_or(&Value::Null);
                if self.record_response(req_id, document.clone()) {
                    info!(parent: &self.span, "Response {} with rc {}", req_id, rc);
                }
            }
            None => warn!(parent: &self.span, "Response on {} without {}", topic, REQUEST_ID_FIELD),
        }
        None
    }
}

/// `{"d": <data>, "reqId": <id>}`, `d` omitted when there is no data
pub fn request_envelope(data: Option<Value>, req_id: &str) -> Value {
    let mut envelope = Map::new();
    if let Some(data) = data.filter(|d| !d.is_null()) {
        envelope.insert("d".to_string(), data);
    }
    envelope.insert(REQUEST_ID_FIELD.to_string(), Value::String(req_id.to_string()));
    Value::Object(envelope)
}
