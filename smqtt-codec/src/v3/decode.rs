use std::num::NonZeroU16;

use bytes::{Buf, Bytes};
use bytestring::ByteString;

use crate::error::DecodeError;
use crate::types::{packet_type, QoS, MQTT, MQTT_LEVEL_311, WILL_QOS_SHIFT};
use crate::utils::Decode;

use super::packet::{Connect, ConnectAck, LastWill, Packet, Publish, SubscribeReturnCode};
use super::{ConnectAckFlags, ConnectFlags};

/// Parses the body of one packet, `header` is the first byte of its fixed header.
///
/// `src` must hold exactly the remaining length, leftover bytes are an error.
pub(crate) fn decode_packet(mut src: Bytes, header: u8) -> Result<Packet, DecodeError> {
    let src = &mut src;
    let packet = match header {
        packet_type::CONNECT => Packet::Connect(Box::new(read_connect(src)?)),
        packet_type::CONNACK => Packet::ConnectAck(read_connect_ack(src)?),
        packet_type::PUBLISH_START..=packet_type::PUBLISH_END => Packet::Publish(read_publish(src, header)?),
        packet_type::PUBACK => Packet::PublishAck { packet_id: NonZeroU16::decode(src)? },
        packet_type::PUBREC => Packet::PublishReceived { packet_id: NonZeroU16::decode(src)? },
        packet_type::PUBREL => Packet::PublishRelease { packet_id: NonZeroU16::decode(src)? },
        packet_type::PUBCOMP => Packet::PublishComplete { packet_id: NonZeroU16::decode(src)? },
        packet_type::SUBSCRIBE => {
            let packet_id = NonZeroU16::decode(src)?;
            Packet::Subscribe { packet_id, topic_filters: read_list(src, read_filter_qos)? }
        }
        packet_type::SUBACK => {
            let packet_id = NonZeroU16::decode(src)?;
            Packet::SubscribeAck { packet_id, status: read_return_codes(src)? }
        }
        packet_type::UNSUBSCRIBE => {
            let packet_id = NonZeroU16::decode(src)?;
            Packet::Unsubscribe { packet_id, topic_filters: read_list(src, ByteString::decode)? }
        }
        packet_type::UNSUBACK => Packet::UnsubscribeAck { packet_id: NonZeroU16::decode(src)? },
        packet_type::PINGREQ => Packet::PingRequest,
        packet_type::PINGRESP => Packet::PingResponse,
        packet_type::DISCONNECT => Packet::Disconnect,
        _ => return Err(DecodeError::UnsupportedPacketType),
    };
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(packet)
}

fn read_connect(src: &mut Bytes) -> Result<Connect, DecodeError> {
    let protocol = Bytes::decode(src).map_err(|_| DecodeError::InvalidProtocol)?;
    ensure!(protocol.as_ref() == MQTT, DecodeError::InvalidProtocol);
    // level, flags and keepalive
    ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
    ensure!(src.get_u8() == MQTT_LEVEL_311, DecodeError::UnsupportedProtocolLevel);
    let flags = ConnectFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnectReservedFlagSet)?;
    let keep_alive = src.get_u16();

    let clean_session = flags.contains(ConnectFlags::CLEAN_START);
    let client_id = ByteString::decode(src)?;
    ensure!(clean_session || !client_id.is_empty(), DecodeError::InvalidClientId);

    let mut last_will = None;
    if flags.contains(ConnectFlags::WILL) {
        let qos = QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?;
        last_will = Some(LastWill {
            qos,
            retain: flags.contains(ConnectFlags::WILL_RETAIN),
            topic: ByteString::decode(src)?,
            message: Bytes::decode(src)?,
        });
    }
    let username = flags.contains(ConnectFlags::USERNAME).then(|| ByteString::decode(src)).transpose()?;
    let password = flags.contains(ConnectFlags::PASSWORD).then(|| Bytes::decode(src)).transpose()?;

    Ok(Connect { clean_session, keep_alive, last_will, client_id, username, password })
}

fn read_connect_ack(src: &mut Bytes) -> Result<ConnectAck, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    let flags = ConnectAckFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnAckReservedFlagSet)?;
    Ok(ConnectAck {
        session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
        return_code: src.get_u8().try_into()?,
    })
}

fn read_publish(src: &mut Bytes, header: u8) -> Result<Publish, DecodeError> {
    let qos = QoS::try_from((header >> 1) & 0b11)?;
    let topic = ByteString::decode(src)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce | QoS::ExactlyOnce => Some(NonZeroU16::decode(src)?),
    };
    Ok(Publish {
        dup: header & 0b1000 != 0,
        retain: header & 0b0001 != 0,
        qos,
        topic,
        packet_id,
        payload: src.split_off(0),
    })
}

fn read_filter_qos(src: &mut Bytes) -> Result<(ByteString, QoS), DecodeError> {
    let filter = ByteString::decode(src)?;
    ensure!(src.has_remaining(), DecodeError::InvalidLength);
    Ok((filter, QoS::try_from(src.get_u8())?))
}

/// SUBSCRIBE and UNSUBSCRIBE carry at least one entry
fn read_list<T>(src: &mut Bytes, read: fn(&mut Bytes) -> Result<T, DecodeError>) -> Result<Vec<T>, DecodeError> {
    ensure!(src.has_remaining(), DecodeError::MalformedPacket);
    let mut items = Vec::new();
    while src.has_remaining() {
        items.push(read(src)?);
    }
    Ok(items)
}

fn read_return_codes(src: &mut Bytes) -> Result<Vec<SubscribeReturnCode>, DecodeError> {
    let codes = src
        .iter()
        .copied()
        .map(|code| match code {
            0x80 => Ok(SubscribeReturnCode::Failure),
            code => QoS::try_from(code).map(SubscribeReturnCode::Success),
        })
        .collect::<Result<Vec<_>, _>>()?;
    src.advance(codes.len());
    Ok(codes)
}
