use std::io;

/// Inbound bytes that do not form a valid MQTT 3.1.1 packet
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("protocol name is not MQTT")]
    InvalidProtocol,
    /// A field runs past the end of the packet, or bytes are left over after it
    #[error("length does not match packet content")]
    InvalidLength,
    #[error("malformed packet")]
    MalformedPacket,
    #[error("protocol level is not 4")]
    UnsupportedProtocolLevel,
    #[error("reserved bit set in CONNECT flags")]
    ConnectReservedFlagSet,
    #[error("reserved bits set in CONNACK flags")]
    ConnAckReservedFlagSet,
    #[error("empty client id requires a clean session")]
    InvalidClientId,
    #[error("unknown packet type or flags")]
    UnsupportedPacketType,
    #[error("remaining length exceeds the configured maximum")]
    MaxSizeExceeded,
    #[error("string is not valid UTF-8")]
    Utf8Error,
    #[error("io error, {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("remaining length exceeds {}", crate::types::MAX_PACKET_SIZE)]
    OverMaxPacketSize,
    /// A string or binary field longer than 65535 bytes
    #[error("field too long")]
    InvalidLength,
    #[error("packet id on a QoS 0 publish")]
    MalformedPacket,
    #[error("QoS 1 and 2 publishes need a packet id")]
    PacketIdRequired,
    #[error("io error, {0}")]
    Io(#[from] io::Error),
}
