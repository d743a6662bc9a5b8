//! Storage models
//!
//! Plain-data mirrors of the runtime types, kept serde-friendly so any
//! backend can serialize them however it likes.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::{Publish, QoS, Will};
use crate::retained::RetainedMessage;
use crate::session::{InflightMessage, Qos2State, Session, SessionState};

/// A stored PUBLISH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl StoredPublish {
    pub fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
        }
    }

    pub fn into_publish(self) -> Publish {
        Publish {
            dup: false,
            qos: QoS::from_u8(self.qos).unwrap_or(QoS::AtMostOnce),
            retain: self.retain,
            topic: Arc::from(self.topic.as_str()),
            packet_id: None,
            payload: Bytes::from(self.payload),
        }
    }
}

/// A stored retained message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

impl StoredRetainedMessage {
    pub fn from_retained(message: &RetainedMessage) -> Self {
        Self {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
        }
    }

    pub fn into_retained(self) -> RetainedMessage {
        RetainedMessage {
            topic: Arc::from(self.topic.as_str()),
            payload: Bytes::from(self.payload),
            qos: QoS::from_u8(self.qos).unwrap_or(QoS::AtMostOnce),
            stored_at: std::time::Instant::now(),
        }
    }
}

/// A stored inflight entry (outbound QoS > 0 awaiting acknowledgment)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredInflightMessage {
    pub packet_id: u16,
    pub publish: StoredPublish,
    /// True once PUBREC was seen and the entry waits for PUBCOMP
    pub awaiting_pubcomp: bool,
}

/// A stored will message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// A stored session snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub client_id: String,
    pub keep_alive: u16,
    /// filter -> granted qos
    pub subscriptions: Vec<(String, u8)>,
    pub pending: Vec<StoredPublish>,
    pub inflight: Vec<StoredInflightMessage>,
    pub will: Option<StoredWill>,
}

impl StoredSession {
    /// Snapshot a persistent session for storage
    pub fn from_session(session: &Session) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            keep_alive: session.keep_alive,
            subscriptions: session
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter.to_string(), *qos as u8))
                .collect(),
            pending: session.pending_messages.iter().map(StoredPublish::from_publish).collect(),
            inflight: session
                .inflight_outgoing
                .values()
                .map(|m| StoredInflightMessage {
                    packet_id: m.packet_id,
                    publish: StoredPublish::from_publish(&m.publish),
                    awaiting_pubcomp: m.qos2_state == Some(Qos2State::AwaitingPubComp),
                })
                .collect(),
            will: session.will.as_ref().map(|w| StoredWill {
                topic: w.topic.clone(),
                payload: w.payload.to_vec(),
                qos: w.qos as u8,
                retain: w.retain,
            }),
        }
    }

    /// Rebuild a disconnected persistent session from a snapshot
    pub fn into_session(self, max_pending_messages: usize) -> Session {
        let mut session = Session::new(Arc::from(self.client_id.as_str()), max_pending_messages);
        session.clean_session = false;
        session.state = SessionState::Disconnected;
        session.disconnected_at = Some(std::time::Instant::now());
        session.keep_alive = self.keep_alive;

        for (filter, qos) in self.subscriptions {
            session.add_subscription(
                Arc::from(filter.as_str()),
                QoS::from_u8(qos).unwrap_or(QoS::AtMostOnce),
            );
        }

        for stored in self.pending {
            session.pending_messages.push_back(stored.into_publish());
        }

        for stored in self.inflight {
            let mut publish = stored.publish.into_publish();
            publish.packet_id = Some(stored.packet_id);
            let mut inflight = InflightMessage::new(stored.packet_id, publish);
            if stored.awaiting_pubcomp {
                inflight.qos2_state = Some(Qos2State::AwaitingPubComp);
            }
            session.inflight_outgoing.insert(stored.packet_id, inflight);
        }

        session.will = self.will.map(|w| Will {
            topic: w.topic,
            payload: Bytes::from(w.payload),
            qos: QoS::from_u8(w.qos).unwrap_or(QoS::AtMostOnce),
            retain: w.retain,
        });

        session
    }
}

/// Everything loaded from the store at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<StoredRetainedMessage>,
    pub sessions: Vec<StoredSession>,
}

/// Aggregate store statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub sessions: usize,
    pub retained: usize,
    pub messages: usize,
}
