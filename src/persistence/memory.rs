//! In-memory storage backend
//!
//! Keeps everything in process memory with TTL bookkeeping. Useful on its
//! own for single-node deployments without durability requirements, and as
//! the reference implementation of the backend contract.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::backend::StorageBackend;
use super::error::Result;
use super::models::{StoredPublish, StoredRetainedMessage, StoredSession, StoreStats};
use crate::topic::topic_matches_filter;

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl_seconds: Option<u64>) -> Self {
        Self {
            value,
            expires_at: ttl_seconds.map(|ttl| Instant::now() + Duration::from_secs(ttl)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-memory backend with TTL enforcement on read and sweep
pub struct MemoryBackend {
    sessions: DashMap<String, Expiring<StoredSession>>,
    retained: DashMap<String, StoredRetainedMessage>,
    messages: Mutex<Vec<Expiring<StoredPublish>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            retained: DashMap::new(),
            messages: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        if let Some(entry) = self.sessions.get(client_id) {
            if entry.is_expired() {
                drop(entry);
                self.sessions.remove(client_id);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn put_session(&self, session: &StoredSession, ttl_seconds: Option<u64>) -> Result<()> {
        self.sessions.insert(
            session.client_id.clone(),
            Expiring::new(session.clone(), ttl_seconds),
        );
        Ok(())
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone())
            .collect())
    }

    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Ok(self.retained.get(topic).map(|e| e.clone()))
    }

    async fn put_retained(&self, message: &StoredRetainedMessage) -> Result<()> {
        self.retained.insert(message.topic.clone(), message.clone());
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.retained.remove(topic);
        Ok(())
    }

    async fn match_retained(&self, filter: &str) -> Result<Vec<StoredRetainedMessage>> {
        Ok(self
            .retained
            .iter()
            .filter(|e| topic_matches_filter(e.key(), filter))
            .map(|e| e.clone())
            .collect())
    }

    async fn list_retained(&self) -> Result<Vec<StoredRetainedMessage>> {
        Ok(self.retained.iter().map(|e| e.clone()).collect())
    }

    async fn put_message(&self, message: &StoredPublish, ttl_seconds: Option<u64>) -> Result<()> {
        self.messages
            .lock()
            .push(Expiring::new(message.clone(), ttl_seconds));
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            sessions: self.sessions.len(),
            retained: self.retained.len(),
            messages: self.messages.lock().len(),
        })
    }

    async fn sweep_expired(&self) -> Result<()> {
        self.sessions.retain(|_, e| !e.is_expired());
        self.messages.lock().retain(|e| !e.is_expired());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retained(topic: &str, payload: &[u8]) -> StoredRetainedMessage {
        StoredRetainedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: 0,
        }
    }

    fn session(client_id: &str) -> StoredSession {
        StoredSession {
            client_id: client_id.to_string(),
            keep_alive: 60,
            subscriptions: vec![("q/#".to_string(), 1)],
            pending: Vec::new(),
            inflight: Vec::new(),
            will: None,
        }
    }

    #[tokio::test]
    async fn test_retained_roundtrip() {
        let backend = MemoryBackend::new();
        backend.put_retained(&retained("status/x", b"OK")).await.unwrap();

        let got = backend.get_retained("status/x").await.unwrap().unwrap();
        assert_eq!(got.payload, b"OK");

        backend.delete_retained("status/x").await.unwrap();
        assert!(backend.get_retained("status/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_match_retained() {
        let backend = MemoryBackend::new();
        backend.put_retained(&retained("status/a", b"1")).await.unwrap();
        backend.put_retained(&retained("status/b", b"2")).await.unwrap();
        backend.put_retained(&retained("other/c", b"3")).await.unwrap();

        let matches = backend.match_retained("status/+").await.unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn test_session_ttl() {
        let backend = MemoryBackend::new();
        backend.put_session(&session("c1"), Some(0)).await.unwrap();
        backend.put_session(&session("c2"), None).await.unwrap();

        assert!(backend.get_session("c1").await.unwrap().is_none());
        assert!(backend.get_session("c2").await.unwrap().is_some());

        backend.sweep_expired().await.unwrap();
        assert_eq!(backend.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let backend = MemoryBackend::new();
        backend.put_retained(&retained("a", b"1")).await.unwrap();
        backend.put_session(&session("c1"), None).await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.retained, 1);
        assert_eq!(stats.sessions, 1);
    }
}
