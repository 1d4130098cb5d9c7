//! In-memory transport for unit tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{QoS, Transport, TransportError};

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl Published {
    pub fn document(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

type Responder = Box<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Default)]
pub(crate) struct RecordingTransport {
    published: Mutex<Vec<Published>>,
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    fail_publish: AtomicBool,
    responder: Mutex<Option<Responder>>,
}

impl RecordingTransport {
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.document())
            .collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Called with every successfully published JSON document
    pub fn respond_with(&self, responder: impl Fn(&str, &Value) + Send + Sync + 'static) {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("publish rejected".to_string()));
        }
        let document = serde_json::from_slice::<Value>(&payload).ok();
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
        });
        if let (Some(document), Some(responder)) = (document, self.responder.lock().unwrap().as_ref()) {
            responder(topic, &document);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        self.subscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.unsubscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
