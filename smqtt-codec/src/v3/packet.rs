use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;

use crate::types::{packet_type, QoS};

pub use crate::types::Publish;

prim_enum! {
    /// CONNACK return code
    pub enum ConnectAckReason {
        ConnectionAccepted = 0,
        UnacceptableProtocolVersion = 1,
        IdentifierRejected = 2,
        ServiceUnavailable = 3,
        BadUserNameOrPassword = 4,
        NotAuthorized = 5,
        /// 6 is reserved, anything above is malformed
        Reserved = 6
    }
}

impl From<ConnectAckReason> for u8 {
    fn from(v: ConnectAckReason) -> Self {
        v as u8
    }
}

impl ConnectAckReason {
    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "accepted",
            ConnectAckReason::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectAckReason::IdentifierRejected => "client identifier rejected",
            ConnectAckReason::ServiceUnavailable => "broker unavailable",
            ConnectAckReason::BadUserNameOrPassword => "bad user name or password",
            ConnectAckReason::NotAuthorized => "not authorized",
            ConnectAckReason::Reserved => "reserved return code",
        }
    }
}

/// Message the broker publishes on our behalf if the connection drops uncleanly
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: ByteString,
    pub message: Bytes,
}

/// CONNECT content, the protocol level is always 4
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Connect {
    pub clean_session: bool,
    /// seconds, `0` disables keepalive
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    pub client_id: ByteString,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn client_id<T>(mut self, client_id: T) -> Self
    where
        ByteString: From<T>,
    {
        self.client_id = client_id.into();
        self
    }

    pub fn keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct ConnectAck {
    pub return_code: ConnectAckReason,
    /// the broker resumed stored state for this client id
    pub session_present: bool,
}

/// Per-filter result in a SUBACK
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

/// The fourteen MQTT 3.1.1 control packets
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(ConnectAck),
    Publish(Publish),
    /// QoS 1 acknowledgement
    PublishAck { packet_id: NonZeroU16 },
    /// QoS 2, step 2
    PublishReceived { packet_id: NonZeroU16 },
    /// QoS 2, step 3
    PublishRelease { packet_id: NonZeroU16 },
    /// QoS 2, step 4
    PublishComplete { packet_id: NonZeroU16 },
    Subscribe { packet_id: NonZeroU16, topic_filters: Vec<(ByteString, QoS)> },
    /// One return code per requested filter, in request order
    SubscribeAck { packet_id: NonZeroU16, status: Vec<SubscribeReturnCode> },
    Unsubscribe { packet_id: NonZeroU16, topic_filters: Vec<ByteString> },
    UnsubscribeAck { packet_id: NonZeroU16 },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}

impl Packet {
    /// Packet identifier carried by the packet, if any
    pub fn packet_id(&self) -> Option<NonZeroU16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::PublishAck { packet_id }
            | Packet::PublishReceived { packet_id }
            | Packet::PublishRelease { packet_id }
            | Packet::PublishComplete { packet_id }
            | Packet::Subscribe { packet_id, .. }
            | Packet::SubscribeAck { packet_id, .. }
            | Packet::Unsubscribe { packet_id, .. }
            | Packet::UnsubscribeAck { packet_id } => Some(*packet_id),
            Packet::Connect(_)
            | Packet::ConnectAck(_)
            | Packet::PingRequest
            | Packet::PingResponse
            | Packet::Disconnect => None,
        }
    }

    /// Fixed header byte, PUBLISH flags not included
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => packet_type::CONNECT,
            Packet::ConnectAck(_) => packet_type::CONNACK,
            Packet::Publish(_) => packet_type::PUBLISH_START,
            Packet::PublishAck { .. } => packet_type::PUBACK,
            Packet::PublishReceived { .. } => packet_type::PUBREC,
            Packet::PublishRelease { .. } => packet_type::PUBREL,
            Packet::PublishComplete { .. } => packet_type::PUBCOMP,
            Packet::Subscribe { .. } => packet_type::SUBSCRIBE,
            Packet::SubscribeAck { .. } => packet_type::SUBACK,
            Packet::Unsubscribe { .. } => packet_type::UNSUBSCRIBE,
            Packet::UnsubscribeAck { .. } => packet_type::UNSUBACK,
            Packet::PingRequest => packet_type::PINGREQ,
            Packet::PingResponse => packet_type::PINGRESP,
            Packet::Disconnect => packet_type::DISCONNECT,
        }
    }
}
