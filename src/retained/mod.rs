//! Retained message store
//!
//! Maps exact topic to the most recent message published with the retain
//! flag set. An empty-payload retained publish deletes the entry, so the
//! store never holds an empty payload.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::warn;

use crate::protocol::{Publish, QoS};

/// A retained message entry
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub stored_at: Instant,
}

impl RetainedMessage {
    /// Build the PUBLISH delivered to a new subscriber, downgraded to the
    /// granted QoS and with retain set on the wire
    pub fn to_publish(&self, granted_qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos: self.qos.min(granted_qos),
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

/// Store of retained messages, at most one entry per exact topic
pub struct RetainedStore {
    entries: DashMap<Arc<str>, RetainedMessage>,
    /// Maximum number of retained topics (0 = unbounded)
    limit: usize,
}

impl RetainedStore {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            limit,
        }
    }

    /// Apply a retained publish: store the message, or delete the entry when
    /// the payload is empty
    pub fn apply(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            self.entries.remove(publish.topic.as_ref());
            return;
        }

        if self.limit > 0
            && self.entries.len() >= self.limit
            && !self.entries.contains_key(publish.topic.as_ref())
        {
            warn!(
                topic = publish.topic.as_ref(),
                limit = self.limit,
                "retained message limit reached, dropping"
            );
            return;
        }

        self.entries.insert(
            publish.topic.clone(),
            RetainedMessage {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos,
                stored_at: Instant::now(),
            },
        );
    }

    /// Seed an entry directly (startup restore from the persistent store)
    pub fn restore(&self, message: RetainedMessage) {
        if !message.payload.is_empty() {
            self.entries.insert(message.topic.clone(), message);
        }
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.entries.get(topic).map(|e| e.clone())
    }

    pub fn delete(&self, topic: &str) {
        self.entries.remove(topic);
    }

    /// All entries whose topic matches the filter
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        self.entries
            .iter()
            .filter(|entry| crate::topic::topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(topic: &str, payload: &[u8], qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: true,
            topic: Arc::from(topic),
            packet_id: None,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_put_get() {
        let store = RetainedStore::new(0);
        store.apply(&publish("status/x", b"OK", QoS::AtLeastOnce));

        let entry = store.get("status/x").unwrap();
        assert_eq!(entry.payload.as_ref(), b"OK");
        assert_eq!(entry.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_empty_payload_deletes() {
        let store = RetainedStore::new(0);
        store.apply(&publish("status/x", b"OK", QoS::AtMostOnce));
        store.apply(&publish("status/x", b"", QoS::AtMostOnce));

        assert!(store.get("status/x").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_matching() {
        let store = RetainedStore::new(0);
        store.apply(&publish("status/x", b"1", QoS::AtMostOnce));
        store.apply(&publish("status/y", b"2", QoS::AtMostOnce));
        store.apply(&publish("other/z", b"3", QoS::AtMostOnce));

        let matches = store.matching("status/+");
        assert_eq!(matches.len(), 2);

        let matches = store.matching("#");
        assert_eq!(matches.len(), 3);
    }

    #[test]
    fn test_limit() {
        let store = RetainedStore::new(2);
        store.apply(&publish("a", b"1", QoS::AtMostOnce));
        store.apply(&publish("b", b"2", QoS::AtMostOnce));
        store.apply(&publish("c", b"3", QoS::AtMostOnce));

        assert_eq!(store.len(), 2);
        assert!(store.get("c").is_none());

        // Replacing an existing topic is always allowed
        store.apply(&publish("a", b"4", QoS::AtMostOnce));
        assert_eq!(store.get("a").unwrap().payload.as_ref(), b"4");
    }

    #[test]
    fn test_retained_delivery_downgrade() {
        let store = RetainedStore::new(0);
        store.apply(&publish("status/x", b"OK", QoS::ExactlyOnce));

        let out = store.get("status/x").unwrap().to_publish(QoS::AtLeastOnce);
        assert_eq!(out.qos, QoS::AtLeastOnce);
        assert!(out.retain);
    }
}
