//! Per-connection protocol handler
//!
//! One `Connection` is driven per accepted socket, generic over the stream
//! type so TCP, TLS and WebSocket share a single code path. It owns the
//! CONNECT handshake, per-packet dispatch, the outbound QoS state machines
//! with their retransmission sweep, and teardown including the last will.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use super::{BrokerEvent, BrokerState};
use crate::codec::{Decoder, Encoder};
use crate::metrics::Metrics;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::session::{Qos2State, QueueResult, Session, SessionState};
use crate::topic::{validate_topic_filter, validate_topic_name, Subscription};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectionError::Timeout => write!(f, "connection timeout"),
            ConnectionError::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Message on a connection's outbound channel
#[derive(Debug)]
pub enum Outbound {
    /// A routed delivery; the receiving task assigns the packet id
    Publish(Publish),
    /// Another CONNECT claimed this client id; close the socket
    Takeover,
}

/// Connection state
enum State {
    /// Waiting for CONNECT
    Connecting,
    /// Handshake complete
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
}

/// Action produced by the retransmission sweep
enum RetryAction {
    Resend(Publish),
    PubRel(u16),
    Abandon(u16),
}

/// Connection handler, generic over the stream type
pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    state: State,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    broker: Arc<BrokerState>,
    packet_tx: mpsc::Sender<Outbound>,
    packet_rx: mpsc::Receiver<Outbound>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, broker: Arc<BrokerState>) -> Self {
        let (packet_tx, packet_rx) = mpsc::channel(broker.config.outbound_channel_capacity.max(1));

        Self {
            stream,
            addr,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(broker.config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            broker,
            packet_tx,
            packet_rx,
        }
    }

    /// Run the connection to completion
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.broker.config.connect_timeout;
        match timeout(connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("CONNECT deadline lapsed for {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        }

        self.run_connected().await
    }

    /// Encode and write a single packet
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Read until the first packet decodes, which must be CONNECT
    async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            let decoded = match self.decoder.decode(&self.read_buf) {
                Ok(d) => d,
                Err(e @ (DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel(_))) => {
                    // Reply before closing so the client learns why
                    self.write_packet(&Packet::ConnAck(ConnAck::new(
                        ConnectReturnCode::UnacceptableProtocolVersion,
                    )))
                    .await?;
                    return Err(ConnectionError::Decode(e));
                }
                Err(e) => return Err(e.into()),
            };

            if let Some((packet, consumed)) = decoded {
                self.read_buf.advance(consumed);

                return match packet {
                    Packet::Connect(connect) => self.handle_connect(*connect).await,
                    _ => {
                        debug!("first packet from {} was not CONNECT", self.addr);
                        Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                            "first packet must be CONNECT",
                        )))
                    }
                };
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    /// CONNECT handshake
    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        // [MQTT-3.1.3-8] empty client id requires clean_session
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "rejecting empty client id with clean_session=false from {}",
                self.addr
            );
            self.write_packet(&Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::IdentifierRejected,
            )))
            .await?;
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "empty client id with clean_session=false",
            )));
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            generated_client_id().into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        if let Some(ref will) = connect.will {
            if let Err(e) = validate_topic_name(&will.topic) {
                debug!("invalid will topic from {}: {}", client_id, e);
                return Err(ConnectionError::Protocol(ProtocolError::InvalidTopic(e)));
            }
        }

        // Authentication gate
        match self
            .broker
            .auth
            .authenticate(connect.username.as_deref(), connect.password.as_deref())
            .await
        {
            Ok(outcome) if outcome.ok => {}
            Ok(_) => {
                debug!("authentication failed for {}", client_id);
                self.write_packet(&Packet::ConnAck(ConnAck::new(
                    ConnectReturnCode::BadCredentials,
                )))
                .await?;
                return Err(ConnectionError::Protocol(ProtocolError::BadCredentials));
            }
            Err(e) => {
                error!("authentication error for {}: {}", client_id, e);
                self.write_packet(&Packet::ConnAck(ConnAck::new(
                    ConnectReturnCode::ServerUnavailable,
                )))
                .await?;
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "authentication error",
                )));
            }
        }

        // Session takeover: boot the previous connection for this client id
        if let Some(existing) = self.broker.connections.get(&client_id) {
            let _ = existing.try_send(Outbound::Takeover);
        }

        // Reconstruct a persistent session from the store when absent in memory
        if !connect.clean_session && self.broker.sessions.get(&client_id).is_none() {
            if let Some(ref persistence) = self.broker.persistence {
                match persistence.get_session(&client_id).await {
                    Ok(Some(stored)) => {
                        let session = stored.into_session(self.broker.config.message_queue_limit);
                        for (filter, qos) in &session.subscriptions {
                            self.broker.subscriptions.subscribe(
                                filter,
                                Subscription {
                                    client_id: client_id.clone(),
                                    qos: *qos,
                                },
                            );
                        }
                        self.broker.sessions.restore(session);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("session lookup failed for {}: {}", client_id, e);
                        let _ = self.broker.events.send(BrokerEvent::StorageError {
                            detail: e.to_string(),
                        });
                    }
                }
            }
        }

        let (session, session_present) = self
            .broker
            .sessions
            .create_or_reuse(&client_id, connect.clean_session);

        // A fresh clean session must not inherit index entries
        if connect.clean_session {
            self.broker.subscriptions.unsubscribe_all(&client_id);
        }

        {
            let mut s = session.write();
            s.clean_session = connect.clean_session;
            s.keep_alive = connect.keep_alive;
            s.state = SessionState::Connected;
            s.will = connect.will;
            s.touch();
        }

        // Resumed subscriptions re-enter the index (idempotent for sessions
        // that stayed in memory, required for store-restored ones)
        if session_present {
            let subs: Vec<_> = {
                let s = session.read();
                s.subscriptions
                    .iter()
                    .map(|(filter, qos)| (filter.clone(), *qos))
                    .collect()
            };
            for (filter, qos) in subs {
                self.broker.subscriptions.subscribe(
                    &filter,
                    Subscription {
                        client_id: client_id.clone(),
                        qos,
                    },
                );
            }
        }

        self.broker
            .connections
            .insert(client_id.clone(), self.packet_tx.clone());

        // CONNACK precedes any other server-originated packet
        self.write_packet(&Packet::ConnAck(ConnAck {
            session_present: session_present && !connect.clean_session,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await?;

        self.state = State::Connected {
            client_id: client_id.clone(),
            session: session.clone(),
        };

        let _ = self.broker.events.send(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
        });

        if session_present {
            self.resend_inflight(&session).await?;

            // Retained matches for every pre-existing filter, then the
            // offline queue, all before the dispatch loop starts
            let subs: Vec<_> = {
                let s = session.read();
                s.subscriptions
                    .iter()
                    .map(|(filter, qos)| (filter.clone(), *qos))
                    .collect()
            };
            for (filter, qos) in subs {
                self.send_retained(&session, &filter, qos).await?;
            }

            self.drain_window(&session).await?;
        }

        Ok(())
    }

    /// Retransmit surviving inflight entries after a reconnect
    async fn resend_inflight(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let mut actions: Vec<RetryAction> = {
            let mut s = session.write();
            let mut entries: Vec<_> = s.inflight_outgoing.values_mut().collect();
            entries.sort_by_key(|m| m.packet_id);
            entries
                .into_iter()
                .map(|entry| {
                    entry.sent_at = Instant::now();
                    match entry.qos2_state {
                        Some(Qos2State::AwaitingPubComp) => RetryAction::PubRel(entry.packet_id),
                        _ => {
                            let mut publish = entry.publish.clone();
                            publish.dup = true;
                            publish.packet_id = Some(entry.packet_id);
                            RetryAction::Resend(publish)
                        }
                    }
                })
                .collect()
        };

        for action in actions.drain(..) {
            match action {
                RetryAction::Resend(publish) => {
                    self.write_packet(&Packet::Publish(publish)).await?;
                }
                RetryAction::PubRel(packet_id) => {
                    self.write_packet(&Packet::PubRel(PubRel { packet_id })).await?;
                }
                RetryAction::Abandon(_) => {}
            }
        }

        Ok(())
    }

    /// Main dispatch loop
    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let (client_id, session) = match &self.state {
            State::Connected { client_id, session } => (client_id.clone(), session.clone()),
            _ => {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "not connected",
                )))
            }
        };

        let keep_alive_check = {
            let s = session.read();
            if s.keep_alive == 0 {
                // Keep alive disabled; idle tick that never expires anything
                Duration::from_secs(3600)
            } else {
                Duration::from_secs((s.keep_alive as u64 * 3) / 2)
            }
        };

        let mut retry_ticker = tokio::time::interval(self.broker.config.retry_interval);
        retry_ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("connection closed by {}", self.addr);
                            self.handle_disconnect(&client_id, &session, true);
                            return Ok(());
                        }
                        Ok(_) => {
                            loop {
                                let decoded = match self.decoder.decode(&self.read_buf) {
                                    Ok(d) => d,
                                    Err(e) => {
                                        // Framing or validation failure terminates
                                        // the connection with no reply
                                        warn!("decode error from {}: {}", client_id, e);
                                        self.handle_disconnect(&client_id, &session, true);
                                        return Err(e.into());
                                    }
                                };
                                let Some((packet, consumed)) = decoded else { break };
                                self.read_buf.advance(consumed);

                                {
                                    let mut s = session.write();
                                    s.touch();
                                }

                                match self.handle_packet(&client_id, &session, packet).await {
                                    Ok(()) => {}
                                    Err(ConnectionError::Shutdown) => {
                                        return Ok(());
                                    }
                                    Err(e) => {
                                        error!("error handling packet from {}: {}", client_id, e);
                                        self.handle_disconnect(&client_id, &session, true);
                                        return Err(e);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!("read error from {}: {}", self.addr, e);
                            self.handle_disconnect(&client_id, &session, true);
                            return Err(e.into());
                        }
                    }
                }

                outbound = self.packet_rx.recv() => {
                    match outbound {
                        Some(Outbound::Publish(publish)) => {
                            if let Err(e) = self.deliver(&session, publish).await {
                                self.handle_disconnect(&client_id, &session, true);
                                return Err(e);
                            }
                        }
                        Some(Outbound::Takeover) => {
                            debug!("session takeover for {}", client_id);
                            // The session now belongs to the new connection;
                            // just release the socket
                            return Ok(());
                        }
                        None => {
                            self.handle_disconnect(&client_id, &session, true);
                            return Ok(());
                        }
                    }
                }

                _ = retry_ticker.tick() => {
                    if let Err(e) = self.retry_sweep(&client_id, &session).await {
                        self.handle_disconnect(&client_id, &session, true);
                        return Err(e);
                    }
                }

                _ = tokio::time::sleep(keep_alive_check) => {
                    let expired = {
                        let s = session.read();
                        s.is_keep_alive_expired()
                    };
                    if expired {
                        debug!("keep alive lapsed for {}", client_id);
                        self.handle_disconnect(&client_id, &session, true);
                        return Err(ConnectionError::Protocol(ProtocolError::KeepAliveTimeout));
                    }
                }
            }
        }
    }

    /// Dispatch one decoded packet
    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Protocol(
                ProtocolError::ProtocolViolation("duplicate CONNECT"),
            )),
            Packet::Publish(publish) => self.handle_publish(client_id, session, publish).await,
            Packet::PubAck(puback) => {
                {
                    let mut s = session.write();
                    s.ack_inflight(puback.packet_id);
                }
                self.drain_window(session).await
            }
            Packet::PubRec(pubrec) => self.handle_pubrec(session, pubrec).await,
            Packet::PubRel(pubrel) => {
                {
                    let mut s = session.write();
                    s.qos2_received.remove(&pubrel.packet_id);
                }
                self.write_packet(&Packet::PubComp(PubComp {
                    packet_id: pubrel.packet_id,
                }))
                .await
            }
            Packet::PubComp(pubcomp) => {
                {
                    let mut s = session.write();
                    s.ack_inflight(pubcomp.packet_id);
                }
                self.drain_window(session).await
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, session, subscribe).await
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, session, unsubscribe).await
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client_id);
                // Graceful close suppresses the will
                self.handle_disconnect(client_id, session, false);
                Err(ConnectionError::Shutdown)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "server-originated packet type from client",
                )))
            }
        }
    }

    /// PUBLISH ingress
    async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        trace!(
            "PUBLISH from {} to {} (qos {:?}, retain {})",
            client_id,
            publish.topic,
            publish.qos,
            publish.retain
        );
        Metrics::incr(&self.broker.metrics.messages_received);

        match publish.qos {
            QoS::AtMostOnce => {
                if publish.retain {
                    self.broker.retained.apply(&publish);
                    self.broker.persist_retained(&publish);
                }
                self.route_message(client_id, &publish);
                Ok(())
            }
            QoS::AtLeastOnce => {
                // packet id presence is enforced by the decoder for qos > 0
                let packet_id = publish
                    .packet_id
                    .ok_or(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                        "QoS 1 PUBLISH without packet id",
                    )))?;

                if publish.retain {
                    self.broker.retained.apply(&publish);
                    self.broker.persist_retained(&publish);
                }
                self.broker.persist_message(&publish);

                self.write_packet(&Packet::PubAck(PubAck { packet_id })).await?;
                self.route_message(client_id, &publish);
                Ok(())
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                        "QoS 2 PUBLISH without packet id",
                    )))?;

                let first_delivery = {
                    let mut s = session.write();
                    if s.qos2_received.contains(&packet_id) {
                        false
                    } else {
                        if s.qos2_received.len() >= self.broker.config.max_awaiting_rel {
                            return Err(ConnectionError::Protocol(ProtocolError::ResourceLimit(
                                "too many unreleased QoS 2 publishes",
                            )));
                        }
                        s.qos2_received.insert(packet_id);
                        true
                    }
                };

                if first_delivery {
                    if publish.retain {
                        self.broker.retained.apply(&publish);
                        self.broker.persist_retained(&publish);
                    }
                    self.broker.persist_message(&publish);
                    self.write_packet(&Packet::PubRec(PubRec { packet_id })).await?;
                    // Route exactly once, on the first arrival
                    self.route_message(client_id, &publish);
                } else {
                    // Duplicate: acknowledge again, never re-route
                    self.write_packet(&Packet::PubRec(PubRec { packet_id })).await?;
                }
                Ok(())
            }
        }
    }

    /// Route a message to every matching subscriber
    fn route_message(&self, _sender_id: &Arc<str>, publish: &Publish) {
        let matches = self.broker.subscriptions.matches(&publish.topic);

        for sub in matches {
            let effective_qos = publish.qos.min(sub.qos);

            let mut outgoing = publish.clone();
            outgoing.qos = effective_qos;
            outgoing.dup = false;
            // Republished messages do not carry retain; only retained-store
            // deliveries to new subscribers do
            outgoing.retain = false;
            // The broker assigns a fresh id per subscriber
            outgoing.packet_id = None;

            if let Some(sender) = self.broker.connections.get(&sub.client_id) {
                if sender.try_send(Outbound::Publish(outgoing)).is_err() {
                    // Slow consumer or racing close
                    drop(sender);
                    self.queue_offline(&sub.client_id, publish, effective_qos);
                }
            } else {
                self.queue_offline(&sub.client_id, publish, effective_qos);
            }
        }

        let _ = self.broker.events.send(BrokerEvent::MessagePublished {
            topic: publish.topic.clone(),
            qos: publish.qos,
            retain: publish.retain,
        });
    }

    /// Queue a delivery for a subscriber without a live connection.
    /// Clean sessions discard; persistent sessions enqueue with the
    /// drop-oldest overflow policy.
    fn queue_offline(&self, client_id: &str, publish: &Publish, effective_qos: QoS) {
        let Some(session) = self.broker.sessions.get(client_id) else {
            return;
        };

        let mut s = session.write();
        if s.clean_session {
            return;
        }

        let mut outgoing = publish.clone();
        outgoing.qos = effective_qos;
        outgoing.dup = false;
        outgoing.retain = false;
        outgoing.packet_id = None;

        if s.queue_message(outgoing) == QueueResult::DroppedOldest {
            Metrics::incr(&self.broker.metrics.messages_dropped);
            let _ = self.broker.events.send(BrokerEvent::MessageDropped {
                client_id: s.client_id.clone(),
            });
        }
    }

    /// Outbound delivery entry point for routed publishes.
    /// Goes through the session queue whenever one is pending so per-pair
    /// ordering is preserved.
    async fn deliver(
        &mut self,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        let queue_first = {
            let s = session.read();
            !s.pending_messages.is_empty()
        };

        if queue_first {
            {
                let mut s = session.write();
                if s.queue_message(publish) == QueueResult::DroppedOldest {
                    Metrics::incr(&self.broker.metrics.messages_dropped);
                    let _ = self.broker.events.send(BrokerEvent::MessageDropped {
                        client_id: s.client_id.clone(),
                    });
                }
            }
            self.drain_window(session).await
        } else {
            self.send_publish_now(session, publish).await
        }
    }

    /// Send one PUBLISH to this client, allocating a packet id and tracking
    /// inflight for QoS > 0. A full inflight window diverts the message to
    /// the session queue; packet id exhaustion fails this delivery only.
    async fn send_publish_now(
        &mut self,
        session: &Arc<RwLock<Session>>,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        if publish.qos != QoS::AtMostOnce {
            let diverted = {
                let mut s = session.write();
                if s.inflight_outgoing.len() >= self.broker.config.inflight_window {
                    if s.queue_message(publish.clone()) == QueueResult::DroppedOldest {
                        Metrics::incr(&self.broker.metrics.messages_dropped);
                        let _ = self.broker.events.send(BrokerEvent::MessageDropped {
                            client_id: s.client_id.clone(),
                        });
                    }
                    true
                } else {
                    match s.alloc_packet_id() {
                        Some(id) => {
                            publish.packet_id = Some(id);
                            s.track_inflight(id, publish.clone());
                            false
                        }
                        None => {
                            Metrics::incr(&self.broker.metrics.delivery_failures);
                            let _ = self.broker.events.send(BrokerEvent::DeliveryFailed {
                                client_id: s.client_id.clone(),
                                packet_id: 0,
                            });
                            return Ok(());
                        }
                    }
                }
            };

            if diverted {
                return Ok(());
            }
        }

        self.write_packet(&Packet::Publish(publish)).await?;
        Metrics::incr(&self.broker.metrics.messages_sent);
        Ok(())
    }

    /// Move queued messages into the inflight window while it has room
    async fn drain_window(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        loop {
            let next = {
                let mut s = session.write();
                match s.pending_messages.front().map(|p| p.qos) {
                    None => None,
                    Some(QoS::AtMostOnce) => s.pending_messages.pop_front(),
                    Some(_) => {
                        if s.inflight_outgoing.len() < self.broker.config.inflight_window {
                            s.pending_messages.pop_front()
                        } else {
                            None
                        }
                    }
                }
            };

            match next {
                Some(publish) => self.send_publish_now(session, publish).await?,
                None => return Ok(()),
            }
        }
    }

    /// PUBREC: advance the outbound QoS 2 machine and send PUBREL
    async fn handle_pubrec(
        &mut self,
        session: &Arc<RwLock<Session>>,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = session.write();
            if let Some(inflight) = s.inflight_outgoing.get_mut(&pubrec.packet_id) {
                inflight.qos2_state = Some(Qos2State::AwaitingPubComp);
                // PUBREL gets a fresh retry budget
                inflight.sent_at = Instant::now();
                inflight.retry_count = 0;
            }
        }

        self.write_packet(&Packet::PubRel(PubRel {
            packet_id: pubrec.packet_id,
        }))
        .await
    }

    /// SUBSCRIBE: validate, index, ack, then deliver retained matches
    async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted: Vec<(Arc<str>, QoS)> = Vec::with_capacity(subscribe.filters.len());

        for sub in &subscribe.filters {
            if let Err(e) = validate_topic_filter(&sub.filter) {
                debug!("invalid filter '{}' from {}: {}", sub.filter, client_id, e);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let filter: Arc<str> = sub.filter.as_str().into();

            self.broker.subscriptions.subscribe(
                &sub.filter,
                Subscription {
                    client_id: client_id.clone(),
                    qos: sub.qos,
                },
            );

            // Index and session mirror stay in lockstep
            {
                let mut s = session.write();
                s.add_subscription(filter.clone(), sub.qos);
            }

            return_codes.push(SubscribeReturnCode::granted(sub.qos));
            granted.push((filter, sub.qos));

            debug!("SUBSCRIBE {} to {} (qos {:?})", client_id, sub.filter, sub.qos);
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        // Retained matches go out synchronously, before the dispatch loop can
        // observe any fresh publish for these filters
        for (filter, qos) in granted {
            self.send_retained(session, &filter, qos).await?;
        }

        Ok(())
    }

    /// Deliver retained matches for a newly granted filter
    async fn send_retained(
        &mut self,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        granted_qos: QoS,
    ) -> Result<(), ConnectionError> {
        for retained in self.broker.retained.matching(filter) {
            self.send_publish_now(session, retained.to_publish(granted_qos))
                .await?;
        }
        Ok(())
    }

    /// UNSUBSCRIBE: remove from index and session in lockstep
    async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            self.broker.subscriptions.unsubscribe(filter, client_id);
            {
                let mut s = session.write();
                s.remove_subscription(filter);
            }
            debug!("UNSUBSCRIBE {} from {}", client_id, filter);
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await
    }

    /// Retransmission sweep over this session's inflight entries
    async fn retry_sweep(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let retry_interval = self.broker.config.retry_interval;
        let max_retries = self.broker.config.max_retries;

        let actions: Vec<RetryAction> = {
            let mut s = session.write();
            let mut actions = Vec::new();
            let mut abandoned = Vec::new();

            for (id, entry) in s.inflight_outgoing.iter_mut() {
                if entry.sent_at.elapsed() <= retry_interval {
                    continue;
                }

                entry.retry_count += 1;
                if entry.retry_count > max_retries {
                    abandoned.push(*id);
                    continue;
                }

                entry.sent_at = Instant::now();
                match entry.qos2_state {
                    Some(Qos2State::AwaitingPubComp) => actions.push(RetryAction::PubRel(*id)),
                    _ => {
                        // Retried PUBLISH carries dup; PUBREL never does
                        let mut publish = entry.publish.clone();
                        publish.dup = true;
                        publish.packet_id = Some(*id);
                        actions.push(RetryAction::Resend(publish));
                    }
                }
            }

            for id in abandoned {
                s.inflight_outgoing.remove(&id);
                actions.push(RetryAction::Abandon(id));
            }

            actions
        };

        let mut freed_window = false;
        for action in actions {
            match action {
                RetryAction::Resend(publish) => {
                    self.write_packet(&Packet::Publish(publish)).await?;
                }
                RetryAction::PubRel(packet_id) => {
                    self.write_packet(&Packet::PubRel(PubRel { packet_id })).await?;
                }
                RetryAction::Abandon(packet_id) => {
                    warn!(
                        "delivery to {} abandoned after {} retries (packet id {})",
                        client_id, max_retries, packet_id
                    );
                    Metrics::incr(&self.broker.metrics.delivery_failures);
                    let _ = self.broker.events.send(BrokerEvent::DeliveryFailed {
                        client_id: client_id.clone(),
                        packet_id,
                    });
                    freed_window = true;
                }
            }
        }

        if freed_window {
            self.drain_window(session).await?;
        }

        Ok(())
    }

    /// Teardown: deregister, resolve the session, publish the will on
    /// abnormal close
    fn handle_disconnect(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish_will: bool,
    ) {
        // Only remove our own registration; a takeover may already have
        // replaced it with the successor's channel
        self.broker
            .connections
            .remove_if(client_id, |_, tx| tx.same_channel(&self.packet_tx));

        let (clean_session, will) = {
            let mut s = session.write();
            let will = if publish_will { s.will.take() } else { None };
            s.will = None;
            (s.clean_session, will)
        };

        if clean_session {
            self.broker.subscriptions.unsubscribe_all(client_id);
        }

        self.broker.sessions.disconnect(client_id);

        if clean_session {
            self.broker.persist_delete_session(client_id);
        } else {
            let s = session.read();
            self.broker.persist_session(&s);
        }

        if let Some(will) = will {
            debug!("publishing will for {} to {}", client_id, will.topic);
            let publish = Publish {
                dup: false,
                qos: will.qos,
                retain: will.retain,
                topic: Arc::from(will.topic.as_str()),
                packet_id: None,
                payload: will.payload,
            };

            if publish.retain {
                self.broker.retained.apply(&publish);
                self.broker.persist_retained(&publish);
            }

            self.route_message(client_id, &publish);
        }

        let _ = self.broker.events.send(BrokerEvent::ClientDisconnected {
            client_id: client_id.clone(),
        });

        debug!("client {} disconnected", client_id);
    }
}

/// Generate an id for clients that connect without one.
/// A process-wide counter keeps ids unique; the clock fraction keeps them
/// from colliding with a previous broker incarnation's assignments.
fn generated_client_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static NEXT: AtomicU64 = AtomicU64::new(0);

    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    format!("embermq-{:08x}-{:06x}", nanos, seq & 0xFF_FFFF)
}
