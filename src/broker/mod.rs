//! Broker orchestrator
//!
//! Owns the shared component state, runs the TCP / TLS / WebSocket accept
//! loops with admission control, and drives the periodic sweeps (session
//! expiry, persistent-store maintenance). One task is spawned per
//! connection; the per-connection protocol logic lives in [`Connection`].

mod connection;
pub mod tls;

pub use connection::{Connection, ConnectionError, Outbound};
pub use tls::{load_tls_config, TlsError};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::auth::{AllowAll, AuthProvider};
use crate::config::{Config, ConfigError};
use crate::metrics::Metrics;
use crate::persistence::{
    MemoryBackend, PersistenceManager, PersistenceOp, StoredPublish, StoredSession,
};
use crate::protocol::QoS;
use crate::retained::RetainedStore;
use crate::session::SessionStore;
use crate::topic::{Subscription, SubscriptionStore};
use crate::transport::WsStream;

/// TLS certificate material locations
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
}

/// Runtime broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// MQTT/TCP bind address
    pub bind_addr: SocketAddr,
    /// MQTT/WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// TLS settings; when present the TCP listener is TLS-wrapped
    pub tls: Option<TlsSettings>,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum accepted packet size
    pub max_packet_size: usize,
    /// Deadline for a socket to complete CONNECT
    pub connect_timeout: Duration,
    /// Per-session offline queue bound
    pub message_queue_limit: usize,
    /// Outbound QoS > 0 inflight window per session
    pub inflight_window: usize,
    /// Bound on the inbound QoS 2 received set
    pub max_awaiting_rel: usize,
    /// Interval between retransmission sweeps
    pub retry_interval: Duration,
    /// Retransmissions before a delivery is abandoned
    pub max_retries: u32,
    /// Per-connection outbound channel capacity
    pub outbound_channel_capacity: usize,
    /// Interval between session expiry sweeps
    pub session_expiry_check_interval: Duration,
    /// Persistent session time-to-live while disconnected
    pub session_ttl: Duration,
    /// Maximum retained topics (0 = unbounded)
    pub retained_message_limit: usize,
    /// Enable the persistent store
    pub persistence_enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            ws_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            tls: None,
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            connect_timeout: Duration::from_secs(30),
            message_queue_limit: 1000,
            inflight_window: 32,
            max_awaiting_rel: 100,
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
            outbound_channel_capacity: 1024,
            session_expiry_check_interval: Duration::from_secs(60),
            session_ttl: Duration::from_secs(3600),
            retained_message_limit: 10_000,
            persistence_enabled: false,
        }
    }
}

impl BrokerConfig {
    /// Build the runtime configuration from the file configuration
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: config.server.bind_addr()?,
            ws_bind_addr: config.server.ws_bind_addr()?,
            ws_path: config.server.ws_path.clone(),
            tls: if config.security.enable_tls {
                Some(TlsSettings {
                    cert_file: config.security.cert_file.clone(),
                    key_file: config.security.key_file.clone(),
                    ca_file: config.security.ca_file.clone(),
                })
            } else {
                None
            },
            max_connections: config.server.max_connections,
            max_packet_size: config.server.max_packet_size,
            connect_timeout: config.server.connect_timeout(),
            message_queue_limit: config.performance.message_queue_limit,
            inflight_window: config.performance.inflight_window,
            max_awaiting_rel: config.performance.max_awaiting_rel,
            retry_interval: config.performance.retry_interval_duration(),
            max_retries: config.performance.max_retries,
            outbound_channel_capacity: config.performance.outbound_channel_capacity,
            session_expiry_check_interval: config.performance.expiry_check_interval_duration(),
            session_ttl: config.persistence.session_ttl_duration(),
            retained_message_limit: config.persistence.retained_message_limit,
            persistence_enabled: config.persistence.enabled,
        })
    }
}

/// Broker events for observers (bridges, monitoring, tests)
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: Arc<str>,
    },
    ClientDisconnected {
        client_id: Arc<str>,
    },
    MessagePublished {
        topic: Arc<str>,
        qos: QoS,
        retain: bool,
    },
    /// Offline queue overflow evicted the oldest message
    MessageDropped {
        client_id: Arc<str>,
    },
    /// Retry budget exhausted for an inflight delivery
    DeliveryFailed {
        client_id: Arc<str>,
        packet_id: u16,
    },
    /// Persistent store failure; the broker continues from memory
    StorageError {
        detail: String,
    },
}

/// Shared component state handed to every connection task
pub struct BrokerState {
    pub config: BrokerConfig,
    pub sessions: SessionStore,
    pub subscriptions: SubscriptionStore,
    pub retained: RetainedStore,
    /// Live connections: client id -> outbound channel
    pub connections: DashMap<Arc<str>, mpsc::Sender<Outbound>>,
    pub auth: Arc<dyn AuthProvider>,
    pub events: broadcast::Sender<BrokerEvent>,
    pub metrics: Arc<Metrics>,
    pub persistence: Option<Arc<PersistenceManager>>,
}

impl BrokerState {
    /// Snapshot a persistent session into the store, fire-and-forget
    pub fn persist_session(&self, session: &crate::session::Session) {
        if let Some(ref persistence) = self.persistence {
            persistence.write(PersistenceOp::SetSession {
                session: StoredSession::from_session(session),
                ttl_seconds: Some(self.config.session_ttl.as_secs()),
            });
        }
    }

    pub fn persist_delete_session(&self, client_id: &str) {
        if let Some(ref persistence) = self.persistence {
            persistence.write(PersistenceOp::DeleteSession {
                client_id: client_id.to_string(),
            });
        }
    }

    /// Append an accepted publish to the store's replay log
    pub fn persist_message(&self, publish: &crate::protocol::Publish) {
        if let Some(ref persistence) = self.persistence {
            persistence.write(PersistenceOp::PutMessage {
                message: StoredPublish::from_publish(publish),
                ttl_seconds: None,
            });
        }
    }

    /// Mirror a retained-store change into the persistent store
    pub fn persist_retained(&self, publish: &crate::protocol::Publish) {
        if let Some(ref persistence) = self.persistence {
            if publish.payload.is_empty() {
                persistence.write(PersistenceOp::DeleteRetained {
                    topic: publish.topic.to_string(),
                });
            } else if let Some(entry) = self.retained.get(publish.topic.as_ref()) {
                persistence.write(PersistenceOp::SetRetained {
                    message: crate::persistence::StoredRetainedMessage::from_retained(&entry),
                });
            }
        }
    }
}

/// The MQTT broker
pub struct Broker {
    state: Arc<BrokerState>,
    shutdown: broadcast::Sender<()>,
    /// Active connection count for admission control
    active_connections: Arc<AtomicUsize>,
}

impl Broker {
    /// Create a broker that admits every connection
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_auth(config, Arc::new(AllowAll))
    }

    /// Create a broker with a custom authentication provider
    pub fn with_auth(config: BrokerConfig, auth: Arc<dyn AuthProvider>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        let persistence = if config.persistence_enabled {
            Some(Arc::new(PersistenceManager::new(
                Arc::new(MemoryBackend::new()),
                Duration::from_secs(1),
                256,
            )))
        } else {
            None
        };

        let state = Arc::new(BrokerState {
            sessions: SessionStore::new(config.message_queue_limit, config.session_ttl),
            subscriptions: SubscriptionStore::new(),
            retained: RetainedStore::new(config.retained_message_limit),
            connections: DashMap::new(),
            auth,
            events,
            metrics: Arc::new(Metrics::new()),
            persistence,
            config,
        });

        Self {
            state,
            shutdown,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run the broker until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        if self.state.persistence.is_some() {
            self.restore_persisted_state().await;
            self.spawn_storage_error_bridge();
        }

        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.state.config.bind_addr);

        let tls_acceptor = match self.state.config.tls {
            Some(ref settings) => match load_tls_config(settings) {
                Ok(acceptor) => {
                    info!("TLS enabled on the TCP listener");
                    Some(acceptor)
                }
                Err(e) => {
                    error!("failed to load TLS configuration: {}", e);
                    return Err(std::io::Error::other(e));
                }
            },
            None => None,
        };

        if let Some(ws_addr) = self.state.config.ws_bind_addr {
            self.spawn_ws_listener(ws_addr).await?;
        }

        self.spawn_expiry_sweep();

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.handle_accept(stream, addr, tls_acceptor.clone());
                        }
                        Err(e) => {
                            error!("failed to accept TCP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("broker shutting down");
                    break;
                }
            }
        }

        if let Some(ref persistence) = self.state.persistence {
            if let Err(e) = persistence.shutdown().await {
                warn!("persistence shutdown failed: {}", e);
            }
        }

        Ok(())
    }

    /// Admission check shared by all listeners. Returns a guard that
    /// releases the slot, or `None` when the broker is full.
    fn try_admit(&self) -> Option<ConnectionGuard> {
        let max = self.state.config.max_connections;
        let count = self.active_connections.fetch_add(1, Ordering::AcqRel);
        if count >= max {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            Metrics::incr(&self.state.metrics.connections_refused);
            None
        } else {
            Metrics::incr(&self.state.metrics.connections_accepted);
            Some(ConnectionGuard {
                counter: self.active_connections.clone(),
            })
        }
    }

    fn handle_accept(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    ) {
        let Some(guard) = self.try_admit() else {
            debug!("connection limit reached, refusing {}", addr);
            drop(stream);
            return;
        };

        let state = self.state.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let _guard = guard;

            match tls_acceptor {
                Some(acceptor) => {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!("TLS handshake failed for {}: {}", addr, e);
                            return;
                        }
                    };
                    let mut conn = Connection::new(tls_stream, addr, state);
                    run_connection(&mut conn, addr, &mut shutdown_rx).await;
                }
                None => {
                    let mut conn = Connection::new(stream, addr, state);
                    run_connection(&mut conn, addr, &mut shutdown_rx).await;
                }
            }
        });
    }

    async fn spawn_ws_listener(&self, ws_addr: SocketAddr) -> Result<(), std::io::Error> {
        let ws_listener = TcpListener::bind(ws_addr).await?;
        info!(
            "MQTT/WebSocket listening on {} (path: {})",
            ws_addr, self.state.config.ws_path
        );

        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        let active = self.active_connections.clone();
        let max = self.state.config.max_connections;

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    result = ws_listener.accept() => {
                        let (stream, addr) = match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!("failed to accept WebSocket connection: {}", e);
                                continue;
                            }
                        };

                        let count = active.fetch_add(1, Ordering::AcqRel);
                        if count >= max {
                            active.fetch_sub(1, Ordering::AcqRel);
                            Metrics::incr(&state.metrics.connections_refused);
                            debug!("connection limit reached, refusing {}", addr);
                            continue;
                        }
                        Metrics::incr(&state.metrics.connections_accepted);
                        let guard = ConnectionGuard { counter: active.clone() };

                        let state = state.clone();
                        let ws_path = state.config.ws_path.clone();
                        let mut conn_shutdown_rx = shutdown.subscribe();

                        tokio::spawn(async move {
                            let _guard = guard;
                            match WsStream::accept(stream, &ws_path).await {
                                Ok(ws_stream) => {
                                    debug!("WebSocket handshake complete for {}", addr);
                                    let mut conn = Connection::new(ws_stream, addr, state);
                                    run_connection(&mut conn, addr, &mut conn_shutdown_rx).await;
                                }
                                Err(e) => {
                                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                                }
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(())
    }

    /// Session expiry sweep: drop disconnected persistent sessions past the
    /// TTL, along with their index entries and stored snapshots
    fn spawn_expiry_sweep(&self) {
        let state = self.state.clone();
        let interval = self.state.config.session_expiry_check_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for client_id in state.sessions.cleanup_expired() {
                            debug!("session expired for {}", client_id);
                            state.subscriptions.unsubscribe_all(&client_id);
                            state.persist_delete_session(&client_id);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Reload retained messages and persistent sessions at startup
    async fn restore_persisted_state(&self) {
        let Some(ref persistence) = self.state.persistence else {
            return;
        };

        match persistence.load_all().await {
            Ok(loaded) => {
                let retained_count = loaded.retained.len();
                for stored in loaded.retained {
                    self.state.retained.restore(stored.into_retained());
                }

                let session_count = loaded.sessions.len();
                for stored in loaded.sessions {
                    let session = stored.into_session(self.state.config.message_queue_limit);
                    for (filter, qos) in &session.subscriptions {
                        self.state.subscriptions.subscribe(
                            filter,
                            Subscription {
                                client_id: session.client_id.clone(),
                                qos: *qos,
                            },
                        );
                    }
                    self.state.sessions.restore(session);
                }

                info!(
                    "restored {} retained messages and {} sessions",
                    retained_count, session_count
                );
            }
            Err(e) => {
                warn!("failed to load persisted state, starting empty: {}", e);
                Metrics::incr(&self.state.metrics.storage_errors);
                let _ = self.state.events.send(BrokerEvent::StorageError {
                    detail: e.to_string(),
                });
            }
        }
    }

    /// Forward backend failures onto the broker event channel
    fn spawn_storage_error_bridge(&self) {
        let Some(ref persistence) = self.state.persistence else {
            return;
        };

        let mut errors = persistence.subscribe_errors();
        let events = self.state.events.clone();
        let metrics = self.state.metrics.clone();

        tokio::spawn(async move {
            while let Ok(e) = errors.recv().await {
                Metrics::incr(&metrics.storage_errors);
                let _ = events.send(BrokerEvent::StorageError {
                    detail: e.to_string(),
                });
            }
        });
    }

    /// Signal every task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.state.events.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    pub fn retained_count(&self) -> usize {
        self.state.retained.len()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.state.metrics.clone()
    }
}

/// Decrements the active connection count when a connection task ends
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Drive a connection future against the shutdown signal
async fn run_connection<S>(
    conn: &mut Connection<S>,
    addr: SocketAddr,
    shutdown_rx: &mut broadcast::Receiver<()>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let conn_fut = conn.run();
    tokio::pin!(conn_fut);

    loop {
        tokio::select! {
            biased;

            result = &mut conn_fut => {
                if let Err(e) = result {
                    debug!("connection from {} ended: {}", addr, e);
                }
                break;
            }
            result = shutdown_rx.recv() => {
                match result {
                    Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }
}
