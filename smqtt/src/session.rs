//! Session state machine
//!
//! [`Session`] performs no I/O. The client driver feeds it decoded packets, commands and the
//! current time, and writes out whatever [`Session::poll_outgoing`] hands back. Every mutation
//! of session state therefore happens on the single task that owns the session, which makes it
//! the only authority assigning packet identifiers.

use std::collections::VecDeque;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;

use smqtt_codec::v3::{Connect, ConnectAck, ConnectAckReason, Packet};

use crate::error::{ClientError, ProtocolError};
use crate::options::ClientOptions;
use crate::publisher::{make_publish, validate_publish, Publisher};
use crate::subscriber::Subscriber;
use crate::topic::TopicFilter;
use crate::types::{ConnectionState, Handler, Publish, PublishAck, QoS, Reply, StateCallback};

pub(crate) type Callbacks = Arc<RwLock<Vec<StateCallback>>>;

/// Completion of a QoS 0 publish, resolved once its packet has been written
pub(crate) struct WriteDone(Option<Reply<PublishAck>>);

impl WriteDone {
    #[inline]
    pub(crate) fn finish(self, res: Result<(), ClientError>) {
        if let Some(tx) = self.0 {
            let _ = tx.send(res.map(|()| PublishAck { qos: QoS::AtMostOnce, packet_id: None }));
        }
    }
}

/// A packet waiting to be written
pub struct Outgoing {
    pub packet: Packet,
    done: WriteDone,
}

impl Outgoing {
    #[inline]
    fn new(packet: Packet) -> Self {
        Self { packet, done: WriteDone(None) }
    }

    #[inline]
    pub(crate) fn into_parts(self) -> (Packet, WriteDone) {
        (self.packet, self.done)
    }
}

pub struct Session {
    opts: ClientOptions,
    state: ConnectionState,
    publisher: Publisher,
    subscriber: Subscriber,
    outgoing: VecDeque<Outgoing>,
    last_sent: Instant,
    ping_sent: Option<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    callbacks: Callbacks,
}

impl Session {
    pub fn new(opts: ClientOptions) -> Self {
        let publisher = Publisher::new(opts.max_inflight, opts.retry_interval, opts.retry_limit);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            opts,
            state: ConnectionState::Disconnected,
            publisher,
            subscriber: Subscriber::default(),
            outgoing: VecDeque::new(),
            last_sent: Instant::now(),
            ping_sent: None,
            state_tx,
            callbacks: Callbacks::default(),
        }
    }

    #[inline]
    pub fn client_id(&self) -> &ByteString {
        &self.opts.client_id
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    #[inline]
    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    #[inline]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[inline]
    pub(crate) fn callbacks(&self) -> Callbacks {
        self.callbacks.clone()
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        log::info!("{} connection state {} -> {}", self.opts.client_id, self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        let callbacks = self.callbacks.read().clone();
        for cb in callbacks.iter() {
            cb(state);
        }
    }

    #[inline]
    fn keepalive(&self) -> Duration {
        Duration::from_secs(self.opts.keepalive_secs() as u64)
    }

    /// PINGRESP must arrive within one and a half keepalive intervals after PINGREQ
    #[inline]
    fn keepalive_grace(&self) -> Duration {
        self.keepalive() * 3 / 2
    }

    pub fn connect_packet(&self) -> Connect {
        let mut connect = Connect::default()
            .client_id(self.opts.client_id.clone())
            .keep_alive(self.opts.keepalive_secs())
            .clean_session(self.opts.clean_session);
        connect.last_will = self.opts.last_will.clone();
        connect
    }

    /// Lowest identifier used neither by an in-flight publish nor by a pending (un)subscribe
    fn next_packet_id(&self) -> Option<NonZeroU16> {
        (1..=u16::MAX)
            .find(|id| !self.publisher.contains(id) && !self.subscriber.contains(id))
            .and_then(NonZeroU16::new)
    }

    #[inline]
    fn push(&mut self, packet: Packet) {
        self.outgoing.push_back(Outgoing::new(packet));
    }

    /// Moves waiting publishes into the in-flight window while it has room
    fn fill_window(&mut self, now: Instant) {
        let connected = self.state.is_connected();
        while self.publisher.can_admit() {
            let Some(packet_id) = self.next_packet_id() else {
                log::warn!("{} no free packet id for publish", self.opts.client_id);
                self.publisher.reject_waiting(ClientError::PacketIdExhausted);
                continue;
            };
            if let Some(msg) = self.publisher.admit(packet_id, now) {
                if connected {
                    msg.transmitted = true;
                    self.outgoing.push_back(Outgoing::new(Packet::Publish(msg.publish.clone())));
                }
            }
        }
    }

    /// Error for requests made after the session was closed
    fn closed_error(&self) -> Option<ClientError> {
        match self.state {
            ConnectionState::Disconnecting | ConnectionState::Disconnected => Some(ClientError::Closed),
            ConnectionState::PermanentlyDisconnected => Some(ClientError::PermanentlyDisconnected),
            _ => None,
        }
    }

    /// Handles the CONNACK of a connection attempt.
    ///
    /// On acceptance the in-flight publishes are replayed in submission order, then pending and
    /// (for a new broker session) active subscriptions are sent again.
    pub fn on_connect_ack(&mut self, ack: ConnectAck, now: Instant) -> Result<(), ClientError> {
        if ack.return_code != ConnectAckReason::ConnectionAccepted {
            log::warn!("{} connection refused, {}", self.opts.client_id, ack.return_code.reason());
            return Err(ClientError::Rejected(ack.return_code));
        }
        log::info!("{} connected, session present: {}", self.opts.client_id, ack.session_present);

        self.set_state(ConnectionState::Connected);
        self.last_sent = now;
        self.ping_sent = None;

        let resubscribe = if ack.session_present { Vec::new() } else { self.subscriber.reset_session() };

        for packet in self.publisher.replay(now) {
            self.push(packet);
        }
        for packet in self.subscriber.pending_requests() {
            self.push(packet);
        }
        let deadline = now + self.opts.ack_timeout;
        for (topic, sub) in resubscribe {
            let Some(packet_id) = self.next_packet_id() else {
                log::error!("{} no free packet id to resubscribe {}", self.opts.client_id, topic);
                continue;
            };
            log::debug!("{} resubscribe {}, qos {}", self.opts.client_id, topic, sub.qos);
            let packet =
                self.subscriber.subscribe(packet_id, topic, sub.filter.clone(), sub.qos, sub.handler(), None, deadline);
            self.push(packet);
        }

        self.fill_window(now);
        Ok(())
    }

    /// Processes one packet received from the broker.
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) -> Result<(), ClientError> {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish)?,
            Packet::PublishAck { packet_id } => {
                self.publisher.on_ack(packet_id);
            }
            Packet::PublishReceived { packet_id } => {
                if self.publisher.on_received(packet_id, now) {
                    self.push(Packet::PublishRelease { packet_id });
                }
            }
            Packet::PublishRelease { packet_id } => {
                if !self.subscriber.release(&packet_id) {
                    log::debug!("{} PUBREL for unknown packet id {}", self.opts.client_id, packet_id);
                }
                self.push(Packet::PublishComplete { packet_id });
            }
            Packet::PublishComplete { packet_id } => {
                self.publisher.on_complete(packet_id);
            }
            Packet::SubscribeAck { packet_id, status } => self.subscriber.on_subscribe_ack(packet_id, &status),
            Packet::UnsubscribeAck { packet_id } => self.subscriber.on_unsubscribe_ack(packet_id),
            Packet::PingResponse => self.ping_sent = None,
            packet => {
                return Err(ProtocolError::UnexpectedPacket(format!("{:?} in state {}", packet, self.state)).into())
            }
        }
        self.fill_window(now);
        Ok(())
    }

    fn on_publish(&mut self, publish: Publish) -> Result<(), ClientError> {
        if publish.qos == QoS::AtMostOnce {
            self.subscriber.deliver(&publish);
            return Ok(());
        }
        let packet_id = publish.packet_id.ok_or_else(|| {
            ProtocolError::MalformedPacket(format!("qos {} publish without packet id", publish.qos))
        })?;
        self.subscriber.deliver(&publish);
        if publish.qos == QoS::AtLeastOnce {
            self.push(Packet::PublishAck { packet_id });
        } else {
            self.push(Packet::PublishReceived { packet_id });
        }
        Ok(())
    }

    /// Starts a publish, `reply` resolves with the final outcome.
    ///
    /// QoS 0 requires a live connection, QoS 1/2 publishes are kept across reconnections.
    pub(crate) fn publish(
        &mut self,
        topic: ByteString,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        reply: Reply<PublishAck>,
        now: Instant,
    ) {
        if let Some(e) = self.closed_error() {
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(e) = validate_publish(&topic, &payload, qos, self.opts.max_packet_size) {
            let _ = reply.send(Err(e));
            return;
        }

        let publish = make_publish(topic, payload, qos, retain);
        if qos == QoS::AtMostOnce {
            if self.state.is_connected() {
                self.outgoing.push_back(Outgoing { packet: Packet::Publish(publish), done: WriteDone(Some(reply)) });
            } else {
                let _ = reply.send(Err(ClientError::ConnectionLost));
            }
        } else {
            self.publisher.submit(publish, Some(reply));
            self.fill_window(now);
        }
    }

    pub(crate) fn subscribe(&mut self, topic: ByteString, qos: QoS, handler: Handler, reply: Reply<QoS>, now: Instant) {
        if let Some(e) = self.closed_error() {
            let _ = reply.send(Err(e));
            return;
        }
        let filter = match TopicFilter::parse(&topic) {
            Ok(filter) => filter,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let Some(packet_id) = self.next_packet_id() else {
            let _ = reply.send(Err(ClientError::PacketIdExhausted));
            return;
        };
        let deadline = now + self.opts.ack_timeout;
        let packet = self.subscriber.subscribe(packet_id, topic, filter, qos, handler, Some(reply), deadline);
        if self.state.is_connected() {
            self.push(packet);
        }
    }

    pub(crate) fn unsubscribe(&mut self, topic: ByteString, reply: Reply<()>, now: Instant) {
        if let Some(e) = self.closed_error() {
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(e) = TopicFilter::parse(&topic) {
            let _ = reply.send(Err(e));
            return;
        }
        let Some(packet_id) = self.next_packet_id() else {
            let _ = reply.send(Err(ClientError::PacketIdExhausted));
            return;
        };
        let deadline = now + self.opts.ack_timeout;
        let packet = self.subscriber.unsubscribe(packet_id, topic, Some(reply), deadline);
        if self.state.is_connected() {
            self.push(packet);
        }
    }

    /// Fails every pending operation and queues DISCONNECT.
    pub fn disconnect(&mut self) {
        self.set_state(ConnectionState::Disconnecting);
        self.fail_all(ClientError::ConnectionLost);
        self.push(Packet::Disconnect);
    }

    /// Same as [`Session::disconnect`] without a connection to send DISCONNECT on.
    pub fn disconnect_offline(&mut self) {
        self.fail_all(ClientError::ConnectionLost);
        self.set_state(ConnectionState::Disconnected);
    }

    /// The transport failed.
    ///
    /// Unwritten QoS 0 publishes fail, QoS 1/2 publishes and pending (un)subscribes stay for
    /// the next connection.
    pub fn on_connection_lost(&mut self) {
        self.ping_sent = None;
        for out in self.outgoing.drain(..) {
            out.done.finish(Err(ClientError::ConnectionLost));
        }
        self.set_state(ConnectionState::Lost);
    }

    pub fn fail_all(&mut self, err: ClientError) {
        for out in self.outgoing.drain(..) {
            out.done.finish(Err(err.clone()));
        }
        self.publisher.fail_all(err.clone());
        self.subscriber.fail_all(err);
    }

    /// Drives keepalive, publish retries and (un)subscribe deadlines.
    ///
    /// Returns `ConnectionLost` when PINGRESP did not arrive in time.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), ClientError> {
        self.subscriber.handle_timeout(now);
        if !self.state.is_connected() {
            return Ok(());
        }

        let keepalive = self.keepalive();
        if let Some(ping_sent) = self.ping_sent {
            if now >= ping_sent + self.keepalive_grace() {
                log::warn!("{} no PINGRESP within {:?}", self.opts.client_id, self.keepalive_grace());
                return Err(ClientError::ConnectionLost);
            }
        } else if !keepalive.is_zero() && now >= self.last_sent + keepalive {
            self.ping_sent = Some(now);
            self.push(Packet::PingRequest);
        }

        for packet in self.publisher.retries(now) {
            self.push(packet);
        }
        self.fill_window(now);
        Ok(())
    }

    /// Next instant [`Session::handle_timeout`] has work to do
    pub fn next_timeout(&self) -> Option<Instant> {
        let requests = self.subscriber.next_timeout();
        if !self.state.is_connected() {
            return requests;
        }
        let keepalive = self.keepalive();
        let ping = match self.ping_sent {
            Some(ping_sent) => Some(ping_sent + self.keepalive_grace()),
            None if !keepalive.is_zero() => Some(self.last_sent + keepalive),
            None => None,
        };
        [requests, ping, self.publisher.next_timeout()].into_iter().flatten().min()
    }

    /// Next packet to write, in queue order
    #[inline]
    pub fn poll_outgoing(&mut self, now: Instant) -> Option<Outgoing> {
        let out = self.outgoing.pop_front()?;
        self.last_sent = now;
        Some(out)
    }

    #[inline]
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }
}
