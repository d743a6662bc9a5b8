//! EmberMQ - MQTT 3.1.1 broker
//!
//! A tokio-based broker with persistent sessions, retained messages,
//! QoS 0/1/2 delivery and TCP, TLS and WebSocket transports.

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;
pub mod transport;

pub use auth::{AllowAll, AuthProvider, StaticAuth};
pub use broker::{Broker, BrokerConfig, BrokerEvent};
pub use config::Config;
pub use metrics::{Metrics, MetricsSnapshot};
pub use persistence::{MemoryBackend, PersistenceManager, StorageBackend};
pub use protocol::QoS;
