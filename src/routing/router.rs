use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Local;
use serde_json::Value;
use tracing::{debug, error, warn, Span};

use super::handler::{CommandCallback, HandlerRef};
use super::registry::SharedRegistry;
use super::topic::CommandTopic;
use crate::dispatch::ReplyQueue;
use crate::mqtt::message_manager::{Command, ReplyMessage};

/// Counters of the inbound path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub messages: usize,
    pub replies: usize,
    pub commands: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Counters {
    messages: AtomicUsize,
    replies: AtomicUsize,
    commands: AtomicUsize,
    dropped: AtomicUsize,
}

/// Single entry point for inbound messages
///
/// Looks up the handlers bound to the exact topic, hands them the parsed
/// document and queues whatever they reply. Messages no handler claims are
/// tokenized as command topics and passed to the application callback.
pub struct CallbackRouter {
    registry: SharedRegistry,
    replies: ReplyQueue,
    command_callback: RwLock<Option<Arc<dyn CommandCallback>>>,
    // type and id used for device-form command topics
    identity: Option<(String, String)>,
    counters: Counters,
    span: Span,
}

impl CallbackRouter {
    pub fn new(
        registry: SharedRegistry,
        replies: ReplyQueue,
        identity: Option<(String, String)>,
        span: Span,
    ) -> Self {
        Self {
            registry,
            replies,
            command_callback: RwLock::new(None),
            identity,
            counters: Counters::default(),
            span,
        }
    }

    pub fn set_command_callback(&self, callback: Arc<dyn CommandCallback>) {
        *self
            .command_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn clear_command_callback(&self) {
        *self
            .command_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn on_message(&self, topic: &str, payload: &[u8]) {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        // Clone the bindings so no lock is held while handlers run
        let handlers = self.registry.read().handlers_for(topic);

        if handlers.is_empty() {
            self.deliver_command(topic, payload);
            return;
        }

        match serde_json::from_slice::<Value>(payload) {
            Ok(document) => {
                for handler in &handlers {
                    debug!(parent: &self.span, "Routing {} to {}", topic, handler.name());
                    let reply = handler.on_document(topic, &document);
                    self.forward(handler, reply);
                }
            }
            Err(e) => {
                warn!(
                    parent: &self.span,
                    "Payload on {} is not JSON ({}), using raw entry points", topic, e
                );
                for handler in &handlers {
                    let reply = handler.on_raw(topic, payload);
                    self.forward(handler, reply);
                }
            }
        }
    }

    fn forward(&self, handler: &HandlerRef, reply: Option<ReplyMessage>) {
        let Some(reply) = reply else {
            return;
        };
        debug!(parent: &self.span, "{} replied on {}", handler.name(), reply.topic);
        if self.replies.enqueue(reply) {
            self.counters.replies.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(parent: &self.span, "Reply from {} dropped, dispatcher is gone", handler.name());
        }
    }

    fn deliver_command(&self, topic: &str, payload: &[u8]) {
        let callback = self
            .command_callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(callback) = callback else {
            debug!(parent: &self.span, "No handler or command callback for {}", topic);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let parsed = match CommandTopic::parse(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(parent: &self.span, "Dropping message: {}", e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let Some((device_type, device_id)) = parsed.device.or_else(|| self.identity.clone()) else {
            warn!(parent: &self.span, "Dropping command on {}: no device identity", topic);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let command = Command {
            device_type,
            device_id,
            command_name: parsed.command,
            format: parsed.format,
            payload: payload.to_vec(),
            received: Local::now(),
        };
        debug!(parent: &self.span, "Delivering command {}", command);
        self.counters.commands.fetch_add(1, Ordering::Relaxed);
        callback.on_command(command);
    }

    pub fn connection_lost(&self, cause: &str) {
        error!(parent: &self.span, "Connection lost: {}", cause);
    }

    pub fn delivery_complete(&self, packet_id: u16) {
        debug!(parent: &self.span, "Delivery complete for packet {}", packet_id);
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages: self.counters.messages.load(Ordering::Relaxed),
            replies: self.counters.replies.load(Ordering::Relaxed),
            commands: self.counters.commands.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::MessageHandler;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recording {
        documents: Mutex<Vec<Value>>,
        raw: Mutex<Vec<Vec<u8>>>,
    }

    impl MessageHandler for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn on_document(&self, topic: &str, document: &Value) -> Option<ReplyMessage> {
            self.documents.lock().unwrap().push(document.clone());
            Some(ReplyMessage::at_least_once(topic, json!({"rc": 200})))
        }

        fn on_raw(&self, _topic: &str, payload: &[u8]) -> Option<ReplyMessage> {
            self.raw.lock().unwrap().push(payload.to_vec());
            None
        }
    }

    fn router(identity: Option<(String, String)>) -> (CallbackRouter, SharedRegistry, mpsc::UnboundedReceiver<ReplyMessage>) {
        let registry = SharedRegistry::new();
        let (queue, rx) = ReplyQueue::channel();
        let router = CallbackRouter::new(registry.clone(), queue, identity, Span::none());
        (router, registry, rx)
    }

    #[test]
    fn document_goes_to_every_bound_handler() {
        let (router, registry, mut rx) = router(None);
        let first = Arc::new(Recording::default());
        let second = Arc::new(Recording::default());
        registry.write().add_handler("t", first.clone());
        registry.write().add_handler("t", second.clone());

        router.on_message("t", br#"{"reqId": "1"}"#);

        assert_eq!(first.documents.lock().unwrap().len(), 1);
        assert_eq!(second.documents.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(router.stats().replies, 2);
    }

    #[test]
    fn non_json_payload_takes_raw_path() {
        let (router, registry, mut rx) = router(None);
        let handler = Arc::new(Recording::default());
        registry.write().add_handler("t", handler.clone());

        router.on_message("t", b"not json at all");

        assert!(handler.documents.lock().unwrap().is_empty());
        assert_eq!(handler.raw.lock().unwrap().as_slice(), &[b"not json at all".to_vec()]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unclaimed_gateway_command_reaches_callback() {
        let (router, _registry, _rx) = router(None);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        router.set_command_callback(Arc::new(move |command: Command| {
            sink.lock().unwrap().push(command);
        }));

        router.on_message("iot-2/type/raspi/id/pi1/cmd/reboot/fmt/json", b"{}");

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].device_type, "raspi");
        assert_eq!(received[0].device_id, "pi1");
        assert_eq!(received[0].command_name, "reboot");
        assert_eq!(received[0].format, "json");
    }

    #[test]
    fn device_form_uses_own_identity() {
        let (router, _registry, _rx) = router(Some(("sensor".to_string(), "s1".to_string())));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        router.set_command_callback(Arc::new(move |command: Command| {
            sink.lock().unwrap().push((command.device_type, command.device_id, command.command_name));
        }));

        router.on_message("iot-2/cmd/blink/fmt/text", b"fast");

        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[("sensor".to_string(), "s1".to_string(), "blink".to_string())]
        );
    }

    #[test]
    fn malformed_command_topic_is_dropped() {
        let (router, _registry, _rx) = router(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        router.set_command_callback(Arc::new(move |_: Command| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        router.on_message("iot-2/type/raspi/cmd/reboot/fmt/json", b"{}");
        router.on_message("somewhere/else", b"{}");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.stats().dropped, 2);
    }
}
