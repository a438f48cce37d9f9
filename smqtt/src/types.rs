use std::fmt;
use std::num::NonZeroU16;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use tokio::sync::oneshot;

pub use smqtt_codec::types::QoS;
pub use smqtt_codec::v3::{LastWill, Publish};

use crate::error::ClientError;

pub type PacketId = u16;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Lifecycle of the connection as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// The transport failed, the supervisor is about to reconnect
    Lost,
    /// The supervisor gave up reconnecting
    PermanentlyDisconnected,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Lost => "lost",
            ConnectionState::PermanentlyDisconnected => "permanently disconnected",
        };
        f.write_str(s)
    }
}

/// An application message received from the broker
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: ByteString,
    pub payload: Bytes,
    /// Delivered QoS, never above the granted QoS of the matching subscription
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present for QoS 1 and 2 only
    pub packet_id: Option<NonZeroU16>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("dup", &self.dup)
            .field("packet_id", &self.packet_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Successful outcome of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub qos: QoS,
    pub packet_id: Option<NonZeroU16>,
}

/// Receives inbound messages of a subscription
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, msg: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    #[inline]
    fn on_message(&self, msg: &Message) {
        self(msg)
    }
}

pub(crate) type Handler = Arc<dyn MessageHandler>;

pub(crate) type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync + 'static>;
