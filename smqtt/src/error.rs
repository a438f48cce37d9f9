use std::num::NonZeroU16;

use smqtt_codec::v3::ConnectAckReason;
use smqtt_net::{MqttError, TlsError};

/// A broken byte stream or a packet that does not fit the current state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed packet, {0}")]
    MalformedPacket(String),
    #[error("unexpected packet, {0}")]
    UnexpectedPacket(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("tls error, {0}")]
    Tls(#[from] TlsError),
    #[error("protocol error, {0}")]
    Protocol(#[from] ProtocolError),
    /// No CONNACK within the connect timeout
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("connection rejected, {}", _0.reason())]
    Rejected(ConnectAckReason),
    #[error("connection lost")]
    ConnectionLost,
    /// Retry limit exhausted for a QoS 1/2 publish
    #[error("delivery failed, packet id {0}")]
    DeliveryFailed(NonZeroU16),
    #[error("payload too large, {size} bytes, at most {max} allowed")]
    PayloadTooLarge { size: usize, max: usize },
    /// The reconnection supervisor gave up
    #[error("permanently disconnected")]
    PermanentlyDisconnected,
    #[error("invalid topic, {0}")]
    InvalidTopic(String),
    #[error("subscribe failed, {0}")]
    SubscribeFailed(String),
    #[error("acknowledgement timeout")]
    Timeout,
    #[error("no packet id available")]
    PacketIdExhausted,
    /// The client was disconnected on request
    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Errors after which the current connection must not be used any more
    #[inline]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ClientError::Protocol(_) | ClientError::ConnectionLost | ClientError::Tls(_))
    }
}

impl From<MqttError> for ClientError {
    fn from(e: MqttError) -> Self {
        match e {
            MqttError::Tls(e) => ClientError::Tls(e),
            e if e.is_io() => ClientError::ConnectionLost,
            MqttError::Decode(e) => ClientError::Protocol(ProtocolError::MalformedPacket(e.to_string())),
            MqttError::Encode(e) => ClientError::Protocol(ProtocolError::MalformedPacket(e.to_string())),
            MqttError::UnexpectedPacket(s) => ClientError::Protocol(ProtocolError::UnexpectedPacket(s)),
            MqttError::ReadTimeout
            | MqttError::WriteTimeout
            | MqttError::FlushTimeout
            | MqttError::CloseTimeout
            | MqttError::Disconnected => ClientError::ConnectionLost,
        }
    }
}

#[cfg(test)]
mod tests {
    use smqtt_codec::error::{DecodeError, EncodeError};

    use super::*;

    #[test]
    fn test_from_mqtt_error() {
        assert_eq!(ClientError::from(MqttError::ReadTimeout), ClientError::ConnectionLost);
        assert_eq!(ClientError::from(MqttError::Disconnected), ClientError::ConnectionLost);
        assert!(matches!(
            ClientError::from(MqttError::Decode(DecodeError::MalformedPacket)),
            ClientError::Protocol(ProtocolError::MalformedPacket(_))
        ));
        assert_eq!(
            ClientError::from(MqttError::Tls(TlsError::ExpiredCertificate("x".into()))),
            ClientError::Tls(TlsError::ExpiredCertificate("x".into()))
        );
        let broken = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        assert_eq!(ClientError::from(MqttError::Decode(DecodeError::Io(broken()))), ClientError::ConnectionLost);
        assert_eq!(ClientError::from(MqttError::Encode(EncodeError::Io(broken()))), ClientError::ConnectionLost);
        assert!(ClientError::ConnectionLost.is_connection_fatal());
        assert!(!ClientError::Timeout.is_connection_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ClientError::Rejected(ConnectAckReason::NotAuthorized).to_string(),
            "connection rejected, not authorized"
        );
        assert_eq!(
            ClientError::PayloadTooLarge { size: 10, max: 5 }.to_string(),
            "payload too large, 10 bytes, at most 5 allowed"
        );
    }
}
