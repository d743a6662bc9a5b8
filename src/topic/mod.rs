//! Subscription index
//!
//! Stores subscriptions keyed by topic filter and answers, for a concrete
//! topic, the set of matching subscribers deduplicated per client at the
//! highest granted QoS.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::protocol::QoS;

/// A subscription entry in the index
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Owning client
    pub client_id: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
}

/// Thread-safe subscription store backed by the topic trie.
///
/// Reader-writer discipline: every PUBLISH takes a read lock, while
/// SUBSCRIBE/UNSUBSCRIBE and disconnect purges take the write lock.
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add a subscription; a repeat for the same (filter, client) replaces
    /// the granted QoS
    pub fn subscribe(&self, filter: &str, subscription: Subscription) {
        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            subs.retain(|s| s.client_id != subscription.client_id);
            subs.push(subscription);
        } else {
            trie.insert(filter, vec![subscription]);
        }
    }

    /// Remove one client's subscription to a filter.
    /// Returns true if an entry was removed.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            let len_before = subs.len();
            subs.retain(|s| s.client_id.as_ref() != client_id);
            let removed = subs.len() != len_before;
            if subs.is_empty() {
                trie.remove(filter);
            }
            removed
        } else {
            false
        }
    }

    /// Remove every subscription owned by a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// Find the subscribers matching a topic, one entry per client at the
    /// highest granted QoS across that client's matching filters
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let trie = self.trie.read();
        let mut best: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(16);

        trie.matches(topic, |subs| {
            for sub in subs {
                let entry = best.entry(sub.client_id.clone()).or_insert(sub.qos);
                if sub.qos > *entry {
                    *entry = sub.qos;
                }
            }
        });

        best.into_iter()
            .map(|(client_id, qos)| Subscription { client_id, qos })
            .collect()
    }

    /// Total number of stored subscriptions
    pub fn len(&self) -> usize {
        let trie = self.trie.read();
        let mut count = 0;
        trie.for_each(|subs| count += subs.len());
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(client: &str, qos: QoS) -> Subscription {
        Subscription {
            client_id: client.into(),
            qos,
        }
    }

    #[test]
    fn test_subscribe_and_match() {
        let store = SubscriptionStore::new();
        store.subscribe("sensors/+/temp", sub("a", QoS::AtMostOnce));
        store.subscribe("sensors/#", sub("b", QoS::AtLeastOnce));

        let matches = store.matches("sensors/kitchen/temp");
        assert_eq!(matches.len(), 2);

        let matches = store.matches("lights/kitchen");
        assert!(matches.is_empty());
    }

    #[test]
    fn test_highest_qos_per_client() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", sub("c1", QoS::AtMostOnce));
        store.subscribe("a/+", sub("c1", QoS::ExactlyOnce));

        let matches = store.matches("a/b");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_resubscribe_replaces_qos() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", sub("c1", QoS::AtMostOnce));
        store.subscribe("a/b", sub("c1", QoS::AtLeastOnce));

        let matches = store.matches("a/b");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].qos, QoS::AtLeastOnce);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", sub("c1", QoS::AtMostOnce));

        assert!(store.unsubscribe("a/b", "c1"));
        assert!(!store.unsubscribe("a/b", "c1"));
        assert!(store.matches("a/b").is_empty());
    }

    #[test]
    fn test_unsubscribe_all() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", sub("c1", QoS::AtMostOnce));
        store.subscribe("x/#", sub("c1", QoS::AtLeastOnce));
        store.subscribe("a/b", sub("c2", QoS::AtMostOnce));

        store.unsubscribe_all("c1");

        assert!(store.matches("x/y").is_empty());
        let matches = store.matches("a/b");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].client_id.as_ref(), "c2");
    }
}
