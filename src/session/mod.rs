//! Session management
//!
//! Owns all per-client state that must survive the connection when
//! `clean_session = false`: the subscription map, the bounded offline queue,
//! the outbound inflight window and the inbound QoS 2 received set.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::{Publish, QoS, Will};

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Outbound QoS 2 handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    AwaitingPubRec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    AwaitingPubComp,
}

/// An outbound QoS > 0 delivery awaiting its terminal acknowledgment
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    pub publish: Publish,
    /// `None` for QoS 1 (single PUBACK step)
    pub qos2_state: Option<Qos2State>,
    /// When the last (re)transmission went out
    pub sent_at: Instant,
    pub retry_count: u32,
}

impl InflightMessage {
    pub fn new(packet_id: u16, publish: Publish) -> Self {
        let qos2_state = if publish.qos == QoS::ExactlyOnce {
            Some(Qos2State::AwaitingPubRec)
        } else {
            None
        };
        Self {
            packet_id,
            publish,
            qos2_state,
            sent_at: Instant::now(),
            retry_count: 0,
        }
    }
}

/// Outcome of queueing an offline message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    Queued,
    /// The queue was full; the oldest message was evicted to make room
    DroppedOldest,
}

/// Per-client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Clean session flag from the last CONNECT
    pub clean_session: bool,
    /// Connection state
    pub state: SessionState,
    /// Negotiated keep alive in seconds (0 disables the check)
    pub keep_alive: u16,
    /// Creation timestamp
    pub created_at: Instant,
    /// Last packet activity
    pub last_activity: Instant,
    /// Disconnect timestamp, set while disconnected
    pub disconnected_at: Option<Instant>,
    /// Filter -> granted QoS
    pub subscriptions: AHashMap<Arc<str>, QoS>,
    /// Outbound inflight window keyed by packet id
    pub inflight_outgoing: AHashMap<u16, InflightMessage>,
    /// Inbound QoS 2 packet ids already routed, cleared on PUBREL
    pub qos2_received: AHashSet<u16>,
    /// Rolling packet id cursor
    next_packet_id: u16,
    /// Offline queue, oldest first
    pub pending_messages: VecDeque<Publish>,
    /// Offline queue bound
    pub max_pending_messages: usize,
    /// Last will, cleared on graceful DISCONNECT
    pub will: Option<Will>,
}

impl Session {
    pub fn new(client_id: Arc<str>, max_pending_messages: usize) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            clean_session: true,
            state: SessionState::Connected,
            keep_alive: 0,
            created_at: now,
            last_activity: now,
            disconnected_at: None,
            subscriptions: AHashMap::with_capacity(8),
            inflight_outgoing: AHashMap::with_capacity(16),
            qos2_received: AHashSet::with_capacity(16),
            next_packet_id: 1,
            pending_messages: VecDeque::with_capacity(16),
            max_pending_messages,
            will: None,
        }
    }

    /// Allocate the next free packet identifier.
    ///
    /// Walks the 1..=65535 ring from the cursor, skipping ids held by the
    /// inflight window or the QoS 2 received set. Returns `None` when every
    /// id is in use; the caller must fail that delivery rather than block.
    pub fn alloc_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = if self.next_packet_id == u16::MAX {
                1
            } else {
                self.next_packet_id + 1
            };

            if !self.inflight_outgoing.contains_key(&id) && !self.qos2_received.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Record an outbound QoS > 0 delivery in the inflight window
    pub fn track_inflight(&mut self, packet_id: u16, publish: Publish) {
        self.inflight_outgoing
            .insert(packet_id, InflightMessage::new(packet_id, publish));
    }

    /// Remove an inflight entry on its terminal acknowledgment, freeing the id
    pub fn ack_inflight(&mut self, packet_id: u16) -> Option<InflightMessage> {
        self.inflight_outgoing.remove(&packet_id)
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Keep alive lapse check: closed after 1.5x the negotiated interval.
    /// A zero keep alive disables the check.
    pub fn is_keep_alive_expired(&self) -> bool {
        if self.keep_alive == 0 {
            return false;
        }

        let timeout = Duration::from_secs((self.keep_alive as u64 * 3) / 2);
        self.last_activity.elapsed() > timeout
    }

    /// Append to the offline queue, evicting the oldest entry on overflow
    pub fn queue_message(&mut self, publish: Publish) -> QueueResult {
        let mut result = QueueResult::Queued;
        if self.max_pending_messages > 0 && self.pending_messages.len() >= self.max_pending_messages
        {
            self.pending_messages.pop_front();
            result = QueueResult::DroppedOldest;
        }
        self.pending_messages.push_back(publish);
        result
    }

    /// Atomically take the offline queue contents, oldest first
    pub fn drain_pending(&mut self) -> VecDeque<Publish> {
        std::mem::take(&mut self.pending_messages)
    }

    pub fn add_subscription(&mut self, filter: Arc<str>, qos: QoS) {
        self.subscriptions.insert(filter, qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

/// Thread-safe session store
///
/// Clean sessions are destroyed on disconnect; persistent sessions are kept
/// until the expiry sweep finds them disconnected for longer than the TTL.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    /// Offline queue bound applied to new sessions
    max_pending_messages: usize,
    /// Persistent session time-to-live while disconnected
    session_ttl: Duration,
}

impl SessionStore {
    pub fn new(max_pending_messages: usize, session_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_pending_messages,
            session_ttl,
        }
    }

    /// Resolve the session for a CONNECT.
    ///
    /// With `clean = true` any prior session is destroyed and a fresh one
    /// built. Otherwise the existing in-memory session is resumed when
    /// present. Returns the session and whether a prior one existed
    /// (`session_present` is that flag and `!clean`).
    pub fn create_or_reuse(&self, client_id: &str, clean: bool) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean {
            if let Some(session) = self.sessions.get(&client_id) {
                let mut s = session.write();
                s.state = SessionState::Connected;
                s.clean_session = false;
                s.disconnected_at = None;
                s.touch();
                drop(s);
                return (session.clone(), true);
            }
        }

        let mut fresh = Session::new(client_id.clone(), self.max_pending_messages);
        fresh.clean_session = clean;
        let session = Arc::new(RwLock::new(fresh));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    /// Insert a session restored from the persistent store, unless a live
    /// one already exists for that client
    pub fn restore(&self, session: Session) {
        let client_id = session.client_id.clone();
        self.sessions
            .entry(client_id)
            .or_insert_with(|| Arc::new(RwLock::new(session)));
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Mark a session disconnected; clean sessions are destroyed immediately
    pub fn disconnect(&self, client_id: &str) {
        let should_remove = if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            s.state = SessionState::Disconnected;
            s.disconnected_at = Some(Instant::now());
            s.touch();
            s.clean_session
        } else {
            false
        };

        // Remove after releasing the map guard to avoid deadlock
        if should_remove {
            self.sessions.remove(client_id);
        }
    }

    /// Expiry sweep: drop disconnected persistent sessions past the TTL.
    /// Returns the client ids of the sessions removed.
    pub fn cleanup_expired(&self) -> Vec<Arc<str>> {
        let mut expired = Vec::new();
        self.sessions.retain(|client_id, session| {
            let s = session.read();
            let gone = s.state == SessionState::Disconnected
                && s.disconnected_at
                    .is_some_and(|t| t.elapsed() >= self.session_ttl);
            if gone {
                expired.push(client_id.clone());
            }
            !gone
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(topic: &str, packet_id: Option<u16>, qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn test_packet_id_skips_inflight() {
        let mut session = Session::new("c".into(), 10);

        let id = session.alloc_packet_id().unwrap();
        assert_eq!(id, 1);
        session.track_inflight(id, publish("t", Some(id), QoS::AtLeastOnce));

        // 1 is held until acked; cursor moves on
        let id2 = session.alloc_packet_id().unwrap();
        assert_eq!(id2, 2);

        session.ack_inflight(id);
        // After wrap-around, 1 becomes allocatable again
        session.next_packet_id = 1;
        assert_eq!(session.alloc_packet_id(), Some(1));
    }

    #[test]
    fn test_packet_id_never_zero_across_wrap() {
        let mut session = Session::new("c".into(), 10);
        session.next_packet_id = u16::MAX;

        assert_eq!(session.alloc_packet_id(), Some(u16::MAX));
        assert_eq!(session.alloc_packet_id(), Some(1));
    }

    #[test]
    fn test_packet_id_exhaustion_fails() {
        let mut session = Session::new("c".into(), 10);
        for id in 1..=u16::MAX {
            session.track_inflight(id, publish("t", Some(id), QoS::AtLeastOnce));
        }

        assert_eq!(session.alloc_packet_id(), None);

        session.ack_inflight(42);
        assert_eq!(session.alloc_packet_id(), Some(42));
    }

    #[test]
    fn test_packet_id_respects_qos2_received() {
        let mut session = Session::new("c".into(), 10);
        session.qos2_received.insert(1);
        session.qos2_received.insert(2);

        assert_eq!(session.alloc_packet_id(), Some(3));
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let mut session = Session::new("c".into(), 2);

        assert_eq!(
            session.queue_message(publish("q/1", None, QoS::AtMostOnce)),
            QueueResult::Queued
        );
        assert_eq!(
            session.queue_message(publish("q/2", None, QoS::AtMostOnce)),
            QueueResult::Queued
        );
        assert_eq!(
            session.queue_message(publish("q/3", None, QoS::AtMostOnce)),
            QueueResult::DroppedOldest
        );

        let drained = session.drain_pending();
        let topics: Vec<_> = drained.iter().map(|p| p.topic.to_string()).collect();
        assert_eq!(topics, vec!["q/2", "q/3"]);
        assert!(session.pending_messages.is_empty());
    }

    #[test]
    fn test_clean_session_destroyed_on_disconnect() {
        let store = SessionStore::new(10, Duration::from_secs(3600));
        let (_, present) = store.create_or_reuse("c1", true);
        assert!(!present);

        store.disconnect("c1");
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn test_persistent_session_resumed() {
        let store = SessionStore::new(10, Duration::from_secs(3600));
        let (session, present) = store.create_or_reuse("c1", false);
        assert!(!present);
        session.write().add_subscription("q/#".into(), QoS::AtLeastOnce);

        store.disconnect("c1");
        assert!(store.get("c1").is_some());

        let (session, present) = store.create_or_reuse("c1", false);
        assert!(present);
        assert!(session.read().subscriptions.contains_key("q/#"));
    }

    #[test]
    fn test_clean_reconnect_discards_state() {
        let store = SessionStore::new(10, Duration::from_secs(3600));
        let (session, _) = store.create_or_reuse("c1", false);
        session.write().add_subscription("q/#".into(), QoS::AtLeastOnce);
        store.disconnect("c1");

        let (session, present) = store.create_or_reuse("c1", true);
        assert!(!present);
        assert!(session.read().subscriptions.is_empty());
    }

    #[test]
    fn test_expiry_sweep() {
        let store = SessionStore::new(10, Duration::from_millis(0));
        store.create_or_reuse("gone", false);
        store.disconnect("gone");
        store.create_or_reuse("alive", false);

        let expired = store.cleanup_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].as_ref(), "gone");
        assert!(store.get("gone").is_none());
        assert!(store.get("alive").is_some());
    }

    #[test]
    fn test_keep_alive_zero_disables() {
        let mut session = Session::new("c".into(), 10);
        session.keep_alive = 0;
        assert!(!session.is_keep_alive_expired());
    }
}
