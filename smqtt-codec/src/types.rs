use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;

pub(crate) const MQTT: &[u8] = b"MQTT";
pub const MQTT_LEVEL_311: u8 = 4;
pub(crate) const WILL_QOS_SHIFT: u8 = 3;

/// Largest value the 4 byte remaining-length field can carry
pub const MAX_PACKET_SIZE: u32 = 268_435_455;

prim_enum! {
    /// Delivery guarantee of a PUBLISH
    #[derive(PartialOrd, Ord, Hash)]
    pub enum QoS {
        /// Fire and forget, no acknowledgement and no retry
        AtMostOnce = 0,
        /// Acknowledged by PUBACK, may arrive more than once
        AtLeastOnce = 1,
        /// Four step PUBLISH/PUBREC/PUBREL/PUBCOMP exchange, delivered once
        ExactlyOnce = 2
    }
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// The lower of two levels, used to cap inbound delivery at the granted level
    #[inline]
    pub fn less_value(&self, qos: QoS) -> QoS {
        (*self).min(qos)
    }
}

impl From<QoS> for u8 {
    fn from(v: QoS) -> Self {
        v.value()
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

bitflags::bitflags! {
    /// Flags byte of the CONNECT variable header, bit 0 is reserved
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ConnectFlags: u8 {
        const USERNAME    = 0x80;
        const PASSWORD    = 0x40;
        const WILL_RETAIN = 0x20;
        const WILL_QOS    = 0x18;
        const WILL        = 0x04;
        const CLEAN_START = 0x02;
    }
}

bitflags::bitflags! {
    /// Acknowledge flags of CONNACK, bits 7-1 are reserved
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ConnectAckFlags: u8 {
        const SESSION_PRESENT = 0x01;
    }
}

/// First byte of each fixed header, flags included where they are fixed
pub(super) mod packet_type {
    pub(crate) const CONNECT: u8 = 0x10;
    pub(crate) const CONNACK: u8 = 0x20;
    pub(crate) const PUBLISH_START: u8 = 0x30;
    pub(crate) const PUBLISH_END: u8 = 0x3f;
    pub(crate) const PUBACK: u8 = 0x40;
    pub(crate) const PUBREC: u8 = 0x50;
    pub(crate) const PUBREL: u8 = 0x62;
    pub(crate) const PUBCOMP: u8 = 0x70;
    pub(crate) const SUBSCRIBE: u8 = 0x82;
    pub(crate) const SUBACK: u8 = 0x90;
    pub(crate) const UNSUBSCRIBE: u8 = 0xa2;
    pub(crate) const UNSUBACK: u8 = 0xb0;
    pub(crate) const PINGREQ: u8 = 0xc0;
    pub(crate) const PINGRESP: u8 = 0xd0;
    pub(crate) const DISCONNECT: u8 = 0xe0;
}

/// An application message on the wire
#[derive(PartialEq, Eq, Clone)]
pub struct Publish {
    /// set on every retransmission of a QoS 1/2 message
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: ByteString,
    /// `None` exactly when `qos` is `AtMostOnce`
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publish")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("packet_id", &self.packet_id)
            .field("dup", &self.dup)
            .field("retain", &self.retain)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos() {
        assert_eq!(QoS::ExactlyOnce.less_value(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.less_value(QoS::ExactlyOnce), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(2u8).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3u8).is_err());
        assert_eq!(QoS::AtLeastOnce.to_string(), "1");
    }

    #[test]
    fn test_connect_flags() {
        assert!(ConnectFlags::from_bits(0x01).is_none());
        let flags = ConnectFlags::from_bits(0x2e).unwrap();
        assert!(flags.contains(ConnectFlags::WILL | ConnectFlags::WILL_RETAIN | ConnectFlags::CLEAN_START));
        assert_eq!((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT, 1);
    }
}
