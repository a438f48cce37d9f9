use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use bytestring::ByteString;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use smqtt_codec::v3::{Connect, ConnectAck, Packet};
use smqtt_net::{MqttError, MqttStream, SecureSocket, TlsConnector};

use crate::error::ClientError;
use crate::options::ClientOptions;
use crate::session::{Callbacks, Session};
use crate::supervisor::Supervisor;
use crate::types::{ConnectionState, Handler, MessageHandler, PublishAck, QoS, Reply};

/// Opens a fresh socket for every connection attempt
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<Self::Io, ClientError>;
}

#[async_trait]
impl Connector for TlsConnector {
    type Io = SecureSocket;

    #[inline]
    async fn connect(&self) -> Result<SecureSocket, ClientError> {
        Ok(TlsConnector::connect(self).await?)
    }
}

pub(crate) enum Command {
    Publish { topic: ByteString, payload: Bytes, qos: QoS, retain: bool, reply: Reply<PublishAck> },
    Subscribe { topic: ByteString, qos: QoS, handler: Handler, reply: Reply<QoS> },
    Unsubscribe { topic: ByteString, reply: Reply<()> },
    Disconnect { reply: oneshot::Sender<()> },
}

/// Handle to a supervised MQTT session.
///
/// Cloning is cheap, every clone talks to the same session. The session task stops on
/// [`Client::disconnect`], when the last handle is dropped, or when reconnection gives up.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    client_id: ByteString,
    send_timeout: Duration,
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    callbacks: Callbacks,
}

impl Client {
    /// Opens the first connection and starts the session task.
    ///
    /// TLS failures, `Rejected` and `ConnectTimeout` of this first attempt are returned as is,
    /// later connection losses are handled by the reconnection supervisor.
    pub async fn connect<C: Connector>(connector: C, opts: ClientOptions) -> Result<Client, ClientError> {
        let mut session = Session::new(opts.clone());
        session.set_state(ConnectionState::Connecting);

        let stream = match handshake(&connector, session.connect_packet(), &opts).await {
            Ok((stream, ack)) => match session.on_connect_ack(ack, Instant::now()) {
                Ok(()) => stream,
                Err(e) => {
                    session.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            },
            Err(e) => {
                log::warn!("{} connect failed, {}", opts.client_id, e);
                session.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(opts.command_channel_capacity.max(1));
        let inner = ClientInner {
            client_id: opts.client_id.clone(),
            send_timeout: opts.send_timeout,
            cmd_tx,
            state_rx: session.state_receiver(),
            callbacks: session.callbacks(),
        };
        let supervisor = Supervisor::new(&opts.reconnect);
        let driver = Driver { connector, opts, session, cmd_rx, supervisor };
        tokio::spawn(driver.run(stream));

        Ok(Client { inner: Arc::new(inner) })
    }

    #[inline]
    pub fn client_id(&self) -> &ByteString {
        &self.inner.client_id
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    #[inline]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Registers a callback invoked on the session task for every state transition.
    pub fn on_state_change<F>(&self, f: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Arc::new(f));
    }

    /// Publishes `payload` to `topic`.
    ///
    /// QoS 0 resolves once the packet is written, QoS 1 on PUBACK and QoS 2 on PUBCOMP.
    pub async fn publish(
        &self,
        topic: impl Into<ByteString>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishAck, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish { topic: topic.into(), payload: payload.into(), qos, retain, reply }).await?;
        self.recv(rx).await
    }

    /// Subscribes to `topic`, resolves with the QoS granted by the broker.
    ///
    /// `handler` runs on the session task and should return quickly.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        topic: impl Into<ByteString>,
        qos: QoS,
        handler: H,
    ) -> Result<QoS, ClientError> {
        let (reply, rx) = oneshot::channel();
        let handler: Handler = Arc::new(handler);
        self.send(Command::Subscribe { topic: topic.into(), qos, handler, reply }).await?;
        self.recv(rx).await
    }

    pub async fn unsubscribe(&self, topic: impl Into<ByteString>) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe { topic: topic.into(), reply }).await?;
        self.recv(rx).await
    }

    /// Sends DISCONNECT and closes the socket, pending operations fail with `ConnectionLost`.
    ///
    /// Returns within a bounded grace period even when the broker does not read.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Command::Disconnect { reply }).await.is_err() {
            return;
        }
        let grace = self.inner.send_timeout.max(Duration::from_secs(1)) * 2;
        if tokio::time::timeout(grace, rx).await.is_err() {
            log::warn!("{} disconnect not completed within {:?}", self.inner.client_id, grace);
        }
    }

    #[inline]
    async fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.inner.cmd_tx.send(cmd).await.map_err(|_| self.stopped_error())
    }

    #[inline]
    async fn recv<T>(&self, rx: oneshot::Receiver<Result<T, ClientError>>) -> Result<T, ClientError> {
        rx.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// Error for requests made after the session task stopped
    #[inline]
    fn stopped_error(&self) -> ClientError {
        match self.state() {
            ConnectionState::PermanentlyDisconnected => ClientError::PermanentlyDisconnected,
            _ => ClientError::Closed,
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("client_id", &self.inner.client_id).field("state", &self.state()).finish()
    }
}

/// Opens a socket, sends CONNECT and waits for CONNACK.
async fn handshake<C: Connector>(
    connector: &C,
    connect: Connect,
    opts: &ClientOptions,
) -> Result<(MqttStream<C::Io>, ConnectAck), ClientError> {
    let io = connector.connect().await?;
    let mut stream = MqttStream::new(io, opts.max_packet_size, opts.send_timeout);
    stream.send_connect(connect).await?;
    match stream.recv_connect_ack(opts.connect_timeout).await {
        Ok(ack) => Ok((stream, ack)),
        Err(MqttError::ReadTimeout) => Err(ClientError::ConnectTimeout),
        Err(e) => Err(e.into()),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Applies a command to the session, a disconnect request is handed back to the caller.
fn apply(session: &mut Session, cmd: Command) -> Option<oneshot::Sender<()>> {
    let now = Instant::now();
    match cmd {
        Command::Publish { topic, payload, qos, retain, reply } => {
            session.publish(topic, payload, qos, retain, reply, now)
        }
        Command::Subscribe { topic, qos, handler, reply } => session.subscribe(topic, qos, handler, reply, now),
        Command::Unsubscribe { topic, reply } => session.unsubscribe(topic, reply, now),
        Command::Disconnect { reply } => return Some(reply),
    }
    None
}

/// Closes a session that has no live connection
fn close_offline(session: &mut Session, reply: Option<oneshot::Sender<()>>) {
    session.disconnect_offline();
    if let Some(reply) = reply {
        let _ = reply.send(());
    }
}

enum Event {
    Packet(Option<Result<Packet, MqttError>>),
    Command(Option<Command>),
    Timeout,
}

enum Attempt<Io> {
    Connected(MqttStream<Io>),
    Failed(ClientError),
    Closed,
}

/// Owns the session and its connection, runs on its own task
struct Driver<C: Connector> {
    connector: C,
    opts: ClientOptions,
    session: Session,
    cmd_rx: mpsc::Receiver<Command>,
    supervisor: Supervisor,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self, mut stream: MqttStream<C::Io>) {
        loop {
            match self.serve(&mut stream).await {
                Ok(()) => return,
                Err(ClientError::Protocol(e)) => {
                    log::error!("{} closing connection, {}", self.opts.client_id, e);
                    self.session.on_connection_lost();
                }
                Err(e) => {
                    log::warn!("{} connection lost, {}", self.opts.client_id, e);
                    self.session.on_connection_lost();
                }
            }
            stream = match self.reconnect().await {
                Some(stream) => stream,
                None => return,
            };
        }
    }

    /// Runs one established connection, `Ok` once the session was closed on request.
    async fn serve(&mut self, stream: &mut MqttStream<C::Io>) -> Result<(), ClientError> {
        loop {
            self.flush(stream).await?;

            let deadline = self.session.next_timeout();
            let event = tokio::select! {
                packet = stream.next() => Event::Packet(packet),
                cmd = self.cmd_rx.recv() => Event::Command(cmd),
                _ = sleep_until(deadline) => Event::Timeout,
            };

            match event {
                Event::Packet(Some(Ok(packet))) => self.session.handle_packet(packet, Instant::now())?,
                Event::Packet(Some(Err(e))) => return Err(e.into()),
                Event::Packet(None) => return Err(ClientError::ConnectionLost),
                Event::Command(Some(cmd)) => {
                    if let Some(reply) = apply(&mut self.session, cmd) {
                        self.shutdown(stream).await;
                        let _ = reply.send(());
                        return Ok(());
                    }
                }
                Event::Command(None) => {
                    log::debug!("{} all client handles dropped", self.opts.client_id);
                    self.shutdown(stream).await;
                    return Ok(());
                }
                Event::Timeout => self.session.handle_timeout(Instant::now())?,
            }
        }
    }

    async fn flush(&mut self, stream: &mut MqttStream<C::Io>) -> Result<(), ClientError> {
        while let Some(out) = self.session.poll_outgoing(Instant::now()) {
            let (packet, done) = out.into_parts();
            if let Err(e) = stream.send(packet).await {
                done.finish(Err(ClientError::ConnectionLost));
                return Err(e.into());
            }
            done.finish(Ok(()));
        }
        Ok(())
    }

    async fn shutdown(&mut self, stream: &mut MqttStream<C::Io>) {
        self.session.disconnect();
        if let Err(e) = self.flush(stream).await {
            log::debug!("{} send DISCONNECT error, {}", self.opts.client_id, e);
        }
        if let Err(e) = stream.close().await {
            log::debug!("{} close error, {}", self.opts.client_id, e);
        }
        self.session.set_state(ConnectionState::Disconnected);
    }

    /// Reconnects with backoff, `None` when closed on request or when the supervisor gives up.
    async fn reconnect(&mut self) -> Option<MqttStream<C::Io>> {
        loop {
            let Some(delay) = self.supervisor.next_delay() else {
                log::error!(
                    "{} giving up after {} reconnection attempts",
                    self.opts.client_id,
                    self.supervisor.attempts()
                );
                self.session.set_state(ConnectionState::PermanentlyDisconnected);
                self.session.fail_all(ClientError::PermanentlyDisconnected);
                return None;
            };
            log::info!("{} reconnect in {:?}, attempt {}", self.opts.client_id, delay, self.supervisor.attempts());

            if !self.idle(Instant::now() + delay).await {
                return None;
            }

            self.session.set_state(ConnectionState::Connecting);
            match self.attempt().await {
                Attempt::Connected(stream) => {
                    self.supervisor.reset();
                    return Some(stream);
                }
                Attempt::Failed(e) => {
                    log::warn!("{} reconnect failed, {}", self.opts.client_id, e);
                    self.session.set_state(ConnectionState::Lost);
                }
                Attempt::Closed => return None,
            }
        }
    }

    /// Serves commands and deadlines until `until`, `false` when closed on request.
    async fn idle(&mut self, until: Instant) -> bool {
        loop {
            let deadline = self.session.next_timeout();
            tokio::select! {
                _ = tokio::time::sleep_until(until) => return true,
                cmd = self.cmd_rx.recv() => {
                    let closing = match cmd {
                        Some(cmd) => apply(&mut self.session, cmd).map(Some),
                        None => Some(None),
                    };
                    if let Some(reply) = closing {
                        close_offline(&mut self.session, reply);
                        return false;
                    }
                }
                _ = sleep_until(deadline) => {
                    let _ = self.session.handle_timeout(Instant::now());
                }
            }
        }
    }

    /// One connection attempt, commands keep being served while it runs.
    async fn attempt(&mut self) -> Attempt<C::Io> {
        let handshake = handshake(&self.connector, self.session.connect_packet(), &self.opts);
        tokio::pin!(handshake);
        loop {
            let deadline = self.session.next_timeout();
            tokio::select! {
                res = &mut handshake => {
                    return match res {
                        Ok((stream, ack)) => match self.session.on_connect_ack(ack, Instant::now()) {
                            Ok(()) => Attempt::Connected(stream),
                            Err(e) => Attempt::Failed(e),
                        },
                        Err(e) => Attempt::Failed(e),
                    };
                }
                cmd = self.cmd_rx.recv() => {
                    let closing = match cmd {
                        Some(cmd) => apply(&mut self.session, cmd).map(Some),
                        None => Some(None),
                    };
                    if let Some(reply) = closing {
                        close_offline(&mut self.session, reply);
                        return Attempt::Closed;
                    }
                }
                _ = sleep_until(deadline) => {
                    let _ = self.session.handle_timeout(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use smqtt_codec::v3::{ConnectAckReason, Publish, SubscribeReturnCode};
    use smqtt_net::TlsError;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::options::ReconnectOptions;
    use crate::types::Message;

    #[derive(Clone)]
    struct TestConnector {
        tx: mpsc::UnboundedSender<DuplexStream>,
        down: Arc<AtomicBool>,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for TestConnector {
        type Io = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(TlsError::Unreachable("test broker is down".into()).into());
            }
            let (client, broker) = tokio::io::duplex(64 * 1024);
            self.tx.send(broker).map_err(|_| ClientError::ConnectionLost)?;
            Ok(client)
        }
    }

    type Broker = MqttStream<DuplexStream>;

    fn connector() -> (TestConnector, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TestConnector { tx, down: Arc::new(AtomicBool::new(false)), attempts: Arc::new(AtomicUsize::new(0)) }, rx)
    }

    fn options() -> ClientOptions {
        ClientOptions::new("test-client").reconnect(ReconnectOptions {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(4),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_attempts: 5,
        })
    }

    async fn next(broker: &mut Broker) -> Packet {
        broker.recv(Duration::from_secs(3600)).await.unwrap().unwrap()
    }

    async fn accept_with(
        rx: &mut mpsc::UnboundedReceiver<DuplexStream>,
        return_code: ConnectAckReason,
        session_present: bool,
    ) -> (Broker, Connect) {
        let io = rx.recv().await.unwrap();
        let mut broker = MqttStream::new(io, 0, Duration::from_secs(5));
        let connect = match next(&mut broker).await {
            Packet::Connect(connect) => *connect,
            packet => panic!("expected CONNECT, got {:?}", packet),
        };
        broker.send(Packet::ConnectAck(ConnectAck { return_code, session_present })).await.unwrap();
        (broker, connect)
    }

    async fn accept(rx: &mut mpsc::UnboundedReceiver<DuplexStream>, session_present: bool) -> Broker {
        accept_with(rx, ConnectAckReason::ConnectionAccepted, session_present).await.0
    }

    fn expect_publish(packet: Packet) -> Publish {
        match packet {
            Packet::Publish(publish) => publish,
            packet => panic!("expected PUBLISH, got {:?}", packet),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_publish_qos1() {
        let (c, mut rx) = connector();
        let opts = options().keepalive(Duration::from_secs(30));
        let (client, (mut broker, connect)) =
            tokio::join!(Client::connect(c, opts), accept_with(&mut rx, ConnectAckReason::ConnectionAccepted, false));
        let client = client.unwrap();
        assert_eq!(connect.client_id, "test-client");
        assert_eq!(connect.keep_alive, 30);
        assert!(connect.clean_session);
        assert_eq!(client.state(), ConnectionState::Connected);

        let (res, ()) = tokio::join!(client.publish("test/topic", "ping", QoS::AtLeastOnce, false), async {
            let publish = expect_publish(next(&mut broker).await);
            assert_eq!(publish.topic, "test/topic");
            assert_eq!(&publish.payload[..], b"ping");
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            assert!(!publish.dup);
            let packet_id = publish.packet_id.unwrap();
            // an unrelated acknowledgement first
            broker.send(Packet::PublishAck { packet_id: NonZeroU16::new(7).unwrap() }).await.unwrap();
            broker.send(Packet::PublishAck { packet_id }).await.unwrap();
        });
        let ack = res.unwrap();
        assert_eq!(ack.qos, QoS::AtLeastOnce);
        assert!(ack.packet_id.is_some());

        let res = client.publish("test/+", "ping", QoS::AtLeastOnce, false).await;
        assert!(matches!(res, Err(ClientError::InvalidTopic(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejected() {
        let (c, mut rx) = connector();
        let (client, _) = tokio::join!(
            Client::connect(c, options()),
            accept_with(&mut rx, ConnectAckReason::NotAuthorized, false)
        );
        assert_eq!(client.unwrap_err(), ClientError::Rejected(ConnectAckReason::NotAuthorized));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (c, mut rx) = connector();
        let opts = options().connect_timeout(Duration::from_secs(3));
        let start = Instant::now();
        let (client, _broker) = tokio::join!(Client::connect(c, opts), async {
            // reads CONNECT, never answers
            let mut broker = MqttStream::new(rx.recv().await.unwrap(), 0, Duration::from_secs(5));
            next(&mut broker).await;
            broker
        });
        assert_eq!(client.unwrap_err(), ClientError::ConnectTimeout);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_transport_error() {
        let (c, _rx) = connector();
        c.down.store(true, Ordering::SeqCst);
        let attempts = c.attempts.clone();
        let res = Client::connect(c, options()).await;
        assert!(matches!(res, Err(ClientError::Tls(TlsError::Unreachable(_)))));
        // no reconnection for the first attempt
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_peer_gone() {
        let (c, mut rx) = connector();
        let (client, ()) = tokio::join!(Client::connect(c, options()), async {
            drop(rx.recv().await.unwrap());
        });
        assert_eq!(client.unwrap_err(), ClientError::ConnectionLost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_loss_reconnects() {
        let (c, mut rx) = connector();
        let opts = options().keepalive(Duration::from_secs(10));
        let (client, mut broker) = tokio::join!(Client::connect(c, opts), accept(&mut rx, false));
        let client = client.unwrap();
        let start = Instant::now();

        let states = Arc::new(Mutex::new(Vec::new()));
        let s = states.clone();
        client.on_state_change(move |state| s.lock().push(state));
        let mut state_rx = client.state_receiver();

        assert_eq!(next(&mut broker).await, Packet::PingRequest);
        assert!(start.elapsed() >= Duration::from_secs(10));

        state_rx.wait_for(|s| *s == ConnectionState::Lost).await.unwrap();
        let lost_after = start.elapsed();
        assert!(lost_after >= Duration::from_secs(25) && lost_after < Duration::from_secs(26), "{:?}", lost_after);

        let _broker = accept(&mut rx, false).await;
        state_rx.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        assert_eq!(
            *states.lock(),
            vec![ConnectionState::Lost, ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_and_qos2_across_reconnect() {
        let (c, mut rx) = connector();
        let (client, mut broker) = tokio::join!(Client::connect(c, options()), accept(&mut rx, false));
        let client = client.unwrap();

        let a = tokio::spawn({
            let client = client.clone();
            async move { client.publish("test/topic", "A", QoS::AtLeastOnce, false).await }
        });
        let first = expect_publish(next(&mut broker).await);
        let b = tokio::spawn({
            let client = client.clone();
            async move { client.publish("test/topic", "B", QoS::ExactlyOnce, false).await }
        });
        let second = expect_publish(next(&mut broker).await);
        assert_eq!(&first.payload[..], b"A");
        assert_eq!(&second.payload[..], b"B");

        // network drop before either is acknowledged
        drop(broker);

        let mut broker = accept(&mut rx, true).await;
        let replay_a = expect_publish(next(&mut broker).await);
        let replay_b = expect_publish(next(&mut broker).await);
        assert_eq!((&replay_a.payload[..], replay_a.dup, replay_a.packet_id), (&b"A"[..], true, first.packet_id));
        assert_eq!((&replay_b.payload[..], replay_b.dup, replay_b.packet_id), (&b"B"[..], true, second.packet_id));

        let id_a = first.packet_id.unwrap();
        let id_b = second.packet_id.unwrap();
        broker.send(Packet::PublishAck { packet_id: id_a }).await.unwrap();
        broker.send(Packet::PublishReceived { packet_id: id_b }).await.unwrap();
        assert_eq!(next(&mut broker).await, Packet::PublishRelease { packet_id: id_b });
        broker.send(Packet::PublishComplete { packet_id: id_b }).await.unwrap();

        assert_eq!(a.await.unwrap(), Ok(PublishAck { qos: QoS::AtLeastOnce, packet_id: Some(id_a) }));
        assert_eq!(b.await.unwrap(), Ok(PublishAck { qos: QoS::ExactlyOnce, packet_id: Some(id_b) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_gives_up() {
        let (c, mut rx) = connector();
        let down = c.down.clone();
        let attempts = c.attempts.clone();
        let opts = options().reconnect(ReconnectOptions { max_attempts: 2, ..options().reconnect });
        let (client, mut broker) = tokio::join!(Client::connect(c, opts), accept(&mut rx, false));
        let client = client.unwrap();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.publish("test/topic", "lost", QoS::AtLeastOnce, false).await }
        });
        expect_publish(next(&mut broker).await);
        down.store(true, Ordering::SeqCst);
        drop(broker);

        assert_eq!(pending.await.unwrap(), Err(ClientError::PermanentlyDisconnected));
        assert_eq!(client.state(), ConnectionState::PermanentlyDisconnected);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            client.publish("test/topic", "late", QoS::AtMostOnce, false).await,
            Err(ClientError::PermanentlyDisconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_and_deliver() {
        let (c, mut rx) = connector();
        let (client, mut broker) = tokio::join!(Client::connect(c, options()), accept(&mut rx, false));
        let client = client.unwrap();

        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        let handler = move |msg: &Message| {
            let _ = msg_tx.send(msg.clone());
        };
        let (granted, ()) = tokio::join!(client.subscribe("signals/+", QoS::ExactlyOnce, handler), async {
            match next(&mut broker).await {
                Packet::Subscribe { packet_id, topic_filters } => {
                    assert_eq!(topic_filters, vec![(ByteString::from_static("signals/+"), QoS::ExactlyOnce)]);
                    let status = vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)];
                    broker.send(Packet::SubscribeAck { packet_id, status }).await.unwrap();
                }
                packet => panic!("expected SUBSCRIBE, got {:?}", packet),
            }
        });
        assert_eq!(granted, Ok(QoS::AtLeastOnce));

        let packet_id = NonZeroU16::new(100).unwrap();
        let publish = Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: "signals/test".into(),
            packet_id: Some(packet_id),
            payload: Bytes::from_static(b"{\"status\":\"red\"}"),
        };
        broker.send(Packet::Publish(publish)).await.unwrap();
        assert_eq!(next(&mut broker).await, Packet::PublishAck { packet_id });

        let msg = msg_rx.recv().await.unwrap();
        assert_eq!(msg.topic, "signals/test");
        assert_eq!(msg.qos, QoS::AtLeastOnce);
        assert_eq!(&msg.payload[..], b"{\"status\":\"red\"}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_timeout() {
        let (c, mut rx) = connector();
        let opts = options().ack_timeout(Duration::from_secs(5));
        let (client, mut broker) = tokio::join!(Client::connect(c, opts), accept(&mut rx, false));
        let client = client.unwrap();

        let (res, packet) =
            tokio::join!(client.subscribe("signals/test", QoS::AtLeastOnce, |_: &Message| {}), next(&mut broker));
        assert!(matches!(packet, Packet::Subscribe { .. }));
        assert_eq!(res, Err(ClientError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect() {
        let (c, mut rx) = connector();
        let (client, mut broker) = tokio::join!(Client::connect(c, options()), accept(&mut rx, false));
        let client = client.unwrap();

        let (_, packet) = tokio::join!(client.disconnect(), next(&mut broker));
        assert_eq!(packet, Packet::Disconnect);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(broker.recv(Duration::from_secs(1)).await.unwrap(), None);
        assert_eq!(client.publish("test/topic", "x", QoS::AtMostOnce, false).await, Err(ClientError::Closed));
    }
}
