use smqtt_codec::error::{DecodeError, EncodeError};

/// Failures while building or negotiating the TLS transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TlsError {
    /// The broker certificate does not chain to the configured CA
    #[error("untrusted server, {0}")]
    UntrustedServer(String),
    /// A certificate on either side is outside its validity period
    #[error("expired certificate, {0}")]
    ExpiredCertificate(String),
    #[error("tls handshake failed, {0}")]
    HandshakeFailed(String),
    /// Unreadable certificate material, or a client key that does not match its certificate
    #[error("invalid client identity, {0}")]
    InvalidIdentity(String),
    /// The TCP connection could not be established
    #[error("broker unreachable, {0}")]
    Unreachable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// MQTT decoding error
    #[error("Decoding error: {0:?}")]
    Decode(#[from] DecodeError),
    /// MQTT encoding error
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    #[error("Tls error: {0}")]
    Tls(#[from] TlsError),
    /// Read timeout
    #[error("Read timeout")]
    ReadTimeout,
    /// Write timeout
    #[error("Write timeout")]
    WriteTimeout,
    /// Flush timeout
    #[error("Flush timeout")]
    FlushTimeout,
    /// Close timeout
    #[error("Close timeout")]
    CloseTimeout,
    #[error("peer closed the connection")]
    Disconnected,
    /// A packet arrived that is not valid at this point of the exchange
    #[error("unexpected packet, {0}")]
    UnexpectedPacket(String),
}

impl MqttError {
    /// Errors that mean the byte stream can no longer be trusted
    #[inline]
    pub fn is_protocol(&self) -> bool {
        !self.is_io() && matches!(self, MqttError::Decode(_) | MqttError::Encode(_) | MqttError::UnexpectedPacket(_))
    }

    /// A socket read or write failed underneath the codec
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, MqttError::Decode(DecodeError::Io(_)) | MqttError::Encode(EncodeError::Io(_)))
    }
}
