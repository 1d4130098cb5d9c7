use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::handler::HandlerRef;

/// Topic subscriptions and the handlers bound to them
///
/// Plain subscriptions are an ordered list that may hold the same topic more
/// than once. Handler-bound subscriptions additionally live in a multi-map
/// keyed by topic. Removal always takes the first matching entry.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: Vec<String>,
    handlers: HashMap<String, Vec<HandlerRef>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, topic: &str) {
        self.topics.push(topic.to_string());
    }

    /// Adds a topic bound to a handler
    pub fn add_handler(&mut self, topic: &str, handler: HandlerRef) {
        self.topics.push(topic.to_string());
        self.handlers
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    /// Removes the first plain entry for `topic`
    pub fn remove(&mut self, topic: &str) -> bool {
        match self.topics.iter().position(|t| t == topic) {
            Some(index) => {
                self.topics.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes the first binding of `handler` to `topic` together with one
    /// plain entry for the topic
    pub fn remove_handler(&mut self, topic: &str, handler: &HandlerRef) -> bool {
        let Some(bound) = self.handlers.get_mut(topic) else {
            return false;
        };
        let Some(index) = bound.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };

        bound.remove(index);
        if bound.is_empty() {
            self.handlers.remove(topic);
        }
        self.remove(topic);
        true
    }

    /// Drops every entry and binding for `topic`, returns how many entries
    /// were listed
    pub fn remove_topic(&mut self, topic: &str) -> usize {
        let before = self.topics.len();
        self.topics.retain(|t| t != topic);
        self.handlers.remove(topic);
        before - self.topics.len()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    pub fn contains_handler(&self, topic: &str, handler: &HandlerRef) -> bool {
        self.handlers
            .get(topic)
            .is_some_and(|bound| bound.iter().any(|h| Arc::ptr_eq(h, handler)))
    }

    /// Topics in subscription order, duplicates included
    pub fn list(&self) -> Vec<String> {
        self.topics.clone()
    }

    /// Handlers bound to `topic`, in registration order
    pub fn handlers_for(&self, topic: &str) -> Vec<HandlerRef> {
        self.handlers.get(topic).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.handlers.clear();
    }
}

/// Registry shared between the inbound path and the session
///
/// The inbound task reads it for every message while the management
/// handshake writes to it from the caller's task.
#[derive(Clone, Default)]
pub struct SharedRegistry(Arc<RwLock<SubscriptionRegistry>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SubscriptionRegistry> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SubscriptionRegistry> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::ReplyMessage;
    use crate::routing::MessageHandler;
    use serde_json::Value;

    struct Named(&'static str);

    impl MessageHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn on_document(&self, _topic: &str, _document: &Value) -> Option<ReplyMessage> {
            None
        }
    }

    fn handler(name: &'static str) -> HandlerRef {
        Arc::new(Named(name))
    }

    #[test]
    fn duplicate_topics_are_kept_in_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("a");
        registry.add("b");
        registry.add("a");
        assert_eq!(registry.list(), vec!["a", "b", "a"]);

        assert!(registry.remove("a"));
        assert_eq!(registry.list(), vec!["b", "a"]);
        assert!(registry.contains("a"));

        assert!(registry.remove("a"));
        assert!(!registry.contains("a"));
        assert!(!registry.remove("a"));
    }

    #[test]
    fn handlers_bound_to_same_topic() {
        let mut registry = SubscriptionRegistry::new();
        let first = handler("first");
        let second = handler("second");
        registry.add_handler("iotdm-1/device/update", first.clone());
        registry.add_handler("iotdm-1/device/update", second.clone());

        let names: Vec<String> = registry
            .handlers_for("iotdm-1/device/update")
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(registry.contains_handler("iotdm-1/device/update", &second));

        assert!(registry.remove_handler("iotdm-1/device/update", &first));
        assert!(!registry.contains_handler("iotdm-1/device/update", &first));
        assert_eq!(registry.list(), vec!["iotdm-1/device/update"]);

        assert!(registry.remove_handler("iotdm-1/device/update", &second));
        assert!(registry.handlers_for("iotdm-1/device/update").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_unknown_handler_leaves_registry_untouched() {
        let mut registry = SubscriptionRegistry::new();
        registry.add_handler("t", handler("bound"));
        assert!(!registry.remove_handler("t", &handler("stranger")));
        assert!(!registry.remove_handler("other", &handler("bound")));
        assert_eq!(registry.list(), vec!["t"]);
    }

    #[test]
    fn remove_topic_drops_plain_and_bound_entries() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("t");
        registry.add_handler("t", handler("bound"));
        registry.add("other");

        assert_eq!(registry.remove_topic("t"), 2);
        assert!(registry.handlers_for("t").is_empty());
        assert_eq!(registry.list(), vec!["other"]);
    }
}
