//! Storage backend trait
//!
//! Narrow key/value interface the broker persists through. Backends enforce
//! the TTLs they are handed; the broker never re-checks them.

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredPublish, StoredRetainedMessage, StoredSession, StoreStats};

/// Persistence operation for batched background writes
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    SetRetained {
        message: StoredRetainedMessage,
    },
    DeleteRetained {
        topic: String,
    },
    SetSession {
        session: StoredSession,
        ttl_seconds: Option<u64>,
    },
    DeleteSession {
        client_id: String,
    },
    PutMessage {
        message: StoredPublish,
        ttl_seconds: Option<u64>,
    },
}

/// Storage backend for retained messages, sessions and message replay
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get a session snapshot by client id
    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    /// Store a session snapshot, with an optional expiry
    async fn put_session(&self, session: &StoredSession, ttl_seconds: Option<u64>) -> Result<()>;

    /// Delete a session snapshot
    async fn delete_session(&self, client_id: &str) -> Result<()>;

    /// List all live session snapshots
    async fn list_sessions(&self) -> Result<Vec<StoredSession>>;

    /// Get a retained message by exact topic
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    /// Store a retained message, replacing any prior entry for the topic
    async fn put_retained(&self, message: &StoredRetainedMessage) -> Result<()>;

    /// Delete a retained message
    async fn delete_retained(&self, topic: &str) -> Result<()>;

    /// All retained messages whose topic matches the filter
    async fn match_retained(&self, filter: &str) -> Result<Vec<StoredRetainedMessage>>;

    /// List all retained messages
    async fn list_retained(&self) -> Result<Vec<StoredRetainedMessage>>;

    /// Append a message to the replay log, with an optional expiry
    async fn put_message(&self, message: &StoredPublish, ttl_seconds: Option<u64>) -> Result<()>;

    /// Aggregate statistics
    async fn stats(&self) -> Result<StoreStats>;

    /// Execute a batch of operations
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        for op in ops {
            match op {
                PersistenceOp::SetRetained { message } => self.put_retained(&message).await?,
                PersistenceOp::DeleteRetained { topic } => self.delete_retained(&topic).await?,
                PersistenceOp::SetSession {
                    session,
                    ttl_seconds,
                } => self.put_session(&session, ttl_seconds).await?,
                PersistenceOp::DeleteSession { client_id } => {
                    self.delete_session(&client_id).await?
                }
                PersistenceOp::PutMessage {
                    message,
                    ttl_seconds,
                } => self.put_message(&message, ttl_seconds).await?,
            }
        }
        Ok(())
    }

    /// Drop entries past their TTL
    async fn sweep_expired(&self) -> Result<()> {
        Ok(())
    }

    /// Flush pending writes
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Flush and release resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Load everything at startup
    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            retained: self.list_retained().await?,
            sessions: self.list_sessions().await?,
        })
    }
}
