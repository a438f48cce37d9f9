use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{decode as packet_decode, encode as packet_encode, Packet};
use crate::error::{DecodeError, EncodeError};
use crate::types::QoS;
use crate::utils::decode_variable_length;

/// Decodes one packet from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete packet. Nothing is
/// consumed in that case, the caller retries with more bytes appended. On success
/// the packet is returned together with the number of bytes it occupied.
///
/// `max_size` limits the remaining length, `0` means unlimited.
pub fn decode(src: &[u8], max_size: u32) -> Result<Option<(Packet, usize)>, DecodeError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let first_byte = src[0];
    let (remaining_length, consumed) = match decode_variable_length(&src[1..])? {
        Some(v) => v,
        None => return Ok(None),
    };
    if max_size != 0 && max_size < remaining_length {
        return Err(DecodeError::MaxSizeExceeded);
    }
    let header_len = consumed + 1;
    let total = header_len + remaining_length as usize;
    if src.len() < total {
        return Ok(None);
    }
    let body = Bytes::copy_from_slice(&src[header_len..total]);
    let packet = packet_decode::decode_packet(body, first_byte)?;
    Ok(Some((packet, total)))
}

/// Encodes a packet into a fresh buffer.
pub fn encode(packet: &Packet) -> Result<Bytes, EncodeError> {
    let mut dst = BytesMut::new();
    encode_into(packet, &mut dst)?;
    Ok(dst.freeze())
}

fn encode_into(packet: &Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
    // reject before the fixed header lands in `dst`
    if let Packet::Publish(publish) = packet {
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, Some(_)) => return Err(EncodeError::MalformedPacket),
            (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => return Err(EncodeError::PacketIdRequired),
            _ => {}
        }
    }
    let remaining = packet_encode::remaining_length(packet);
    let remaining = u32::try_from(remaining).map_err(|_| EncodeError::OverMaxPacketSize)?;
    dst.reserve(remaining as usize + 5);
    packet_encode::encode(packet, dst, remaining)
}

/// Framing for `tokio_util::codec::Framed`, one [`Packet`] per frame
#[derive(Debug, Clone, Default)]
pub struct Codec {
    max_size: u32,
}

impl Codec {
    /// `max_packet_size` bounds the inbound remaining length, `0` disables the check
    pub fn new(max_packet_size: u32) -> Self {
        Codec { max_size: max_packet_size }
    }

    pub fn set_max_size(&mut self, size: u32) {
        self.max_size = size;
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        match decode(&src[..], self.max_size)? {
            Some((packet, consumed)) => {
                src.advance(consumed);
                Ok(Some(packet))
            }
            None => {
                if let Ok(Some((remaining_length, consumed))) = decode_variable_length(src.get(1..).unwrap_or(&[]))
                {
                    src.reserve((remaining_length as usize + consumed + 1).saturating_sub(src.len()));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        encode_into(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use super::*;
    use crate::v3::{Connect, ConnectAck, ConnectAckReason, LastWill, Publish, SubscribeReturnCode};
    use bytestring::ByteString;

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn publish(payload_len: usize) -> Publish {
        Publish {
            dup: false,
            retain: false,
            qos: QoS::AtMostOnce,
            topic: ByteString::from_static("t"),
            packet_id: None,
            payload: Bytes::from(vec![b'a'; payload_len]),
        }
    }

    #[test]
    fn test_inbound_size_limit() {
        let mut codec = Codec::new(16);
        let mut buf = BytesMut::from(&encode(&Packet::Publish(publish(13))).unwrap()[..]);
        // remaining length 17, one over the limit
        buf[1] += 1;
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MaxSizeExceeded)));

        codec.set_max_size(0);
        let mut buf = BytesMut::new();
        codec.encode(Packet::Publish(publish(64 * 1024)), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::Publish(publish(64 * 1024))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input_is_not_consumed() {
        let bytes = encode(&Packet::PublishAck { packet_id: packet_id(42) }).unwrap();
        for n in 0..bytes.len() {
            assert!(decode(&bytes[..n], 0).unwrap().is_none());
        }

        let mut codec = Codec::default();
        let mut buf = BytesMut::new();
        for b in bytes.iter() {
            buf.extend_from_slice(&[*b]);
            if buf.len() < bytes.len() {
                assert!(codec.decode(&mut buf).unwrap().is_none());
                assert_eq!(&buf[..], &bytes[..buf.len()]);
            }
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PublishAck { packet_id: packet_id(42) }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_packets_in_one_buffer() {
        let mut buf = BytesMut::new();
        let mut codec = Codec::default();
        codec.encode(Packet::PingResponse, &mut buf).unwrap();
        codec.encode(Packet::PublishComplete { packet_id: packet_id(7) }, &mut buf).unwrap();
        buf.extend_from_slice(b"\x90");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingResponse));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PublishComplete { packet_id: packet_id(7) }));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"\x90");
    }

    #[test]
    fn test_overlong_remaining_length() {
        assert!(matches!(decode(b"\x30\xff\xff\xff\xff\x01", 0), Err(DecodeError::MalformedPacket)));
    }

    #[test]
    fn test_publish_requires_packet_id() {
        let mut p = publish(1);
        p.qos = QoS::AtLeastOnce;
        assert!(matches!(encode(&Packet::Publish(p)), Err(EncodeError::PacketIdRequired)));
    }

    #[test]
    fn test_round_trip_all_packets() {
        let packets = vec![
            Packet::Connect(Box::new(Connect {
                clean_session: true,
                keep_alive: 10,
                last_will: Some(LastWill {
                    qos: QoS::AtLeastOnce,
                    retain: true,
                    topic: ByteString::from_static("will/topic"),
                    message: Bytes::from_static(b"gone"),
                }),
                client_id: ByteString::from_static("publisher-1"),
                username: Some(ByteString::from_static("user")),
                password: Some(Bytes::from_static(b"pass")),
            })),
            Packet::ConnectAck(ConnectAck { return_code: ConnectAckReason::ConnectionAccepted, session_present: true }),
            Packet::ConnectAck(ConnectAck { return_code: ConnectAckReason::NotAuthorized, session_present: false }),
            Packet::Publish(Publish {
                dup: true,
                retain: false,
                qos: QoS::ExactlyOnce,
                topic: ByteString::from_static("test/topic"),
                packet_id: Some(packet_id(42)),
                payload: Bytes::from_static(b"ping"),
            }),
            Packet::PublishAck { packet_id: packet_id(1) },
            Packet::PublishReceived { packet_id: packet_id(2) },
            Packet::PublishRelease { packet_id: packet_id(3) },
            Packet::PublishComplete { packet_id: packet_id(u16::MAX) },
            Packet::Subscribe {
                packet_id: packet_id(4),
                topic_filters: vec![
                    (ByteString::from_static("a/+/c"), QoS::AtMostOnce),
                    (ByteString::from_static("a/#"), QoS::ExactlyOnce),
                ],
            },
            Packet::SubscribeAck {
                packet_id: packet_id(4),
                status: vec![SubscribeReturnCode::Success(QoS::AtMostOnce), SubscribeReturnCode::Failure],
            },
            Packet::Unsubscribe { packet_id: packet_id(5), topic_filters: vec![ByteString::from_static("a/#")] },
            Packet::UnsubscribeAck { packet_id: packet_id(5) },
            Packet::PingRequest,
            Packet::PingResponse,
            Packet::Disconnect,
        ];
        for packet in packets {
            let bytes = encode(&packet).unwrap();
            let (decoded, consumed) = decode(&bytes, 0).unwrap().unwrap();
            assert_eq!(decoded, packet);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_round_trip_remaining_length_boundaries() {
        // topic "t" takes 3 bytes of the remaining length
        for remaining in [3usize, 127, 128, 16_383, 16_384] {
            let p = publish(remaining - 3);
            let bytes = encode(&Packet::Publish(p.clone())).unwrap();
            let (decoded, consumed) = decode(&bytes, 0).unwrap().unwrap();
            assert_eq!(decoded, Packet::Publish(p));
            assert_eq!(consumed, bytes.len());
        }

        // an empty remaining length
        let bytes = encode(&Packet::Disconnect).unwrap();
        assert_eq!(&bytes[..], b"\xe0\x00");

        // the largest remaining length is only checked at the header level
        let mut dst = BytesMut::new();
        crate::utils::write_variable_length(crate::types::MAX_PACKET_SIZE, &mut dst).unwrap();
        assert_eq!(crate::utils::decode_variable_length(&dst).unwrap(), Some((crate::types::MAX_PACKET_SIZE, 4)));
        let header = b"\x30\xff\xff\xff\x7f";
        assert!(decode(header, 0).unwrap().is_none());
        assert!(matches!(decode(header, 1024), Err(DecodeError::MaxSizeExceeded)));
    }
}
