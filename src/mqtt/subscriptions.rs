//! Desired-subscription set
//!
//! The registry is the source of truth for what the device wants to be
//! subscribed to. It only records intent; live subscribe/unsubscribe traffic
//! is the client's job. Connect-time replay walks the entries in insertion
//! order, so order is preserved and duplicates are never recorded.

use rumqttc::QoS;
use std::sync::{Mutex, MutexGuard};

/// One desired subscription. Uniqueness is the full (topic, qos) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the pairs that are not already present, in the given order.
    /// Returns the newly recorded entries so the caller can subscribe live.
    pub fn add(&self, pairs: &[(String, QoS)]) -> Vec<Subscription> {
        let mut entries = self.entries();
        let mut added = Vec::new();
        for (topic, qos) in pairs {
            let candidate = Subscription {
                topic: topic.clone(),
                qos: *qos,
            };
            if !entries.contains(&candidate) {
                entries.push(candidate.clone());
                added.push(candidate);
            }
        }
        added
    }

    /// Drop every entry for the named topics. Returns the removed entries so
    /// the caller can unsubscribe live.
    pub fn remove(&self, topics: &[String]) -> Vec<Subscription> {
        let mut entries = self.entries();
        let mut removed = Vec::new();
        entries.retain(|entry| {
            if topics.iter().any(|t| t == &entry.topic) {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Current entries in insertion order.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries().clone()
    }

    pub fn contains(&self, topic: &str, qos: QoS) -> bool {
        self.entries()
            .iter()
            .any(|entry| entry.topic == topic && entry.qos == qos)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(topic: &str, qos: QoS) -> (String, QoS) {
        (topic.to_string(), qos)
    }

    #[test]
    fn test_add_ignores_duplicate_pairs() {
        let registry = SubscriptionRegistry::new();

        let added = registry.add(&[
            pair("device/42/command", QoS::AtLeastOnce),
            pair("device/42/config", QoS::AtLeastOnce),
        ]);
        assert_eq!(added.len(), 2);

        let added = registry.add(&[pair("device/42/command", QoS::AtLeastOnce)]);
        assert!(added.is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_same_topic_with_different_qos_is_a_distinct_entry() {
        let registry = SubscriptionRegistry::new();
        registry.add(&[pair("device/42/command", QoS::AtMostOnce)]);
        let added = registry.add(&[pair("device/42/command", QoS::ExactlyOnce)]);

        assert_eq!(added.len(), 1);
        assert!(registry.contains("device/42/command", QoS::AtMostOnce));
        assert!(registry.contains("device/42/command", QoS::ExactlyOnce));
    }

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let registry = SubscriptionRegistry::new();
        registry.add(&[
            pair("b", QoS::AtMostOnce),
            pair("a", QoS::AtMostOnce),
            pair("c", QoS::AtLeastOnce),
        ]);

        let topics: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|entry| entry.topic)
            .collect();
        assert_eq!(topics, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_remove_drops_every_entry_for_a_topic() {
        let registry = SubscriptionRegistry::new();
        registry.add(&[
            pair("device/42/command", QoS::AtMostOnce),
            pair("device/42/command", QoS::AtLeastOnce),
            pair("device/42/config", QoS::AtLeastOnce),
        ]);

        let removed = registry.remove(&["device/42/command".to_string()]);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("device/42/config", QoS::AtLeastOnce));
    }

    #[test]
    fn test_remove_unknown_topic_is_a_no_op() {
        let registry = SubscriptionRegistry::new();
        registry.add(&[pair("device/42/config", QoS::AtLeastOnce)]);

        let removed = registry.remove(&["device/42/other".to_string()]);
        assert!(removed.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_independent_of_the_registry() {
        let registry = SubscriptionRegistry::new();
        registry.add(&[pair("a", QoS::AtMostOnce)]);

        let mut snapshot = registry.snapshot();
        snapshot.clear();
        assert_eq!(registry.len(), 1);
    }
}
