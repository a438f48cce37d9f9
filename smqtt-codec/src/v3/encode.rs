use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;
use crate::types::{packet_type, ConnectFlags, QoS, MQTT, MQTT_LEVEL_311, WILL_QOS_SHIFT};
use crate::utils::{write_variable_length, Encode};

use super::packet::*;

/// Size of everything after the fixed header
pub(crate) fn remaining_length(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(connect) => connect_length(connect),
        Packet::Publish(publish) => publish_length(publish),
        Packet::ConnectAck(_)
        | Packet::PublishAck { .. }
        | Packet::PublishReceived { .. }
        | Packet::PublishRelease { .. }
        | Packet::PublishComplete { .. }
        | Packet::UnsubscribeAck { .. } => 2,
        Packet::Subscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|(filter, _)| filter.encoded_size() + 1).sum::<usize>()
        }
        Packet::SubscribeAck { status, .. } => 2 + status.len(),
        Packet::Unsubscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(Encode::encoded_size).sum::<usize>()
        }
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => 0,
    }
}

fn connect_length(connect: &Connect) -> usize {
    // protocol name, level, flags and keepalive
    let mut len = MQTT.encoded_size() + 4;
    len += connect.client_id.encoded_size();
    if let Some(will) = &connect.last_will {
        len += will.topic.encoded_size() + will.message.encoded_size();
    }
    len += connect.username.as_ref().map_or(0, Encode::encoded_size);
    len += connect.password.as_ref().map_or(0, Encode::encoded_size);
    len
}

pub(crate) fn publish_length(publish: &Publish) -> usize {
    let packet_id = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
    publish.topic.encoded_size() + packet_id + publish.payload.len()
}

/// First byte of the fixed header, PUBLISH carries its flags in the low nibble
fn first_byte(packet: &Packet) -> u8 {
    match packet {
        Packet::Publish(publish) => {
            packet_type::PUBLISH_START
                | (u8::from(publish.dup) << 3)
                | (publish.qos.value() << 1)
                | u8::from(publish.retain)
        }
        packet => packet.packet_type(),
    }
}

pub(crate) fn encode(packet: &Packet, dst: &mut BytesMut, remaining: u32) -> Result<(), EncodeError> {
    dst.put_u8(first_byte(packet));
    write_variable_length(remaining, dst)?;
    match packet {
        Packet::Connect(connect) => encode_connect(connect, dst),
        Packet::ConnectAck(ack) => {
            dst.put_u8(u8::from(ack.session_present));
            dst.put_u8(ack.return_code.into());
            Ok(())
        }
        Packet::Publish(publish) => encode_publish(publish, dst),
        Packet::PublishAck { packet_id }
        | Packet::PublishReceived { packet_id }
        | Packet::PublishRelease { packet_id }
        | Packet::PublishComplete { packet_id }
        | Packet::UnsubscribeAck { packet_id } => packet_id.encode(dst),
        Packet::Subscribe { packet_id, topic_filters } => {
            packet_id.encode(dst)?;
            for (filter, qos) in topic_filters {
                filter.encode(dst)?;
                dst.put_u8(qos.value());
            }
            Ok(())
        }
        Packet::SubscribeAck { packet_id, status } => {
            packet_id.encode(dst)?;
            for code in status {
                dst.put_u8(match code {
                    SubscribeReturnCode::Success(qos) => qos.value(),
                    SubscribeReturnCode::Failure => 0x80,
                });
            }
            Ok(())
        }
        Packet::Unsubscribe { packet_id, topic_filters } => {
            packet_id.encode(dst)?;
            topic_filters.iter().try_for_each(|filter| filter.encode(dst))
        }
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => Ok(()),
    }
}

fn encode_publish(publish: &Publish, dst: &mut BytesMut) -> Result<(), EncodeError> {
    publish.topic.encode(dst)?;
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, None) => {}
        (QoS::AtMostOnce, Some(_)) => return Err(EncodeError::MalformedPacket),
        (_, Some(packet_id)) => packet_id.encode(dst)?,
        (_, None) => return Err(EncodeError::PacketIdRequired),
    }
    dst.put_slice(&publish.payload);
    Ok(())
}

fn connect_flags(connect: &Connect) -> ConnectFlags {
    let mut flags = ConnectFlags::empty();
    flags.set(ConnectFlags::CLEAN_START, connect.clean_session);
    flags.set(ConnectFlags::USERNAME, connect.username.is_some());
    flags.set(ConnectFlags::PASSWORD, connect.password.is_some());
    if let Some(will) = &connect.last_will {
        flags |= ConnectFlags::WILL;
        flags.set(ConnectFlags::WILL_RETAIN, will.retain);
        flags |= ConnectFlags::from_bits_truncate(will.qos.value() << WILL_QOS_SHIFT);
    }
    flags
}

fn encode_connect(connect: &Connect, dst: &mut BytesMut) -> Result<(), EncodeError> {
    MQTT.encode(dst)?;
    dst.put_u8(MQTT_LEVEL_311);
    dst.put_u8(connect_flags(connect).bits());
    dst.put_u16(connect.keep_alive);
    connect.client_id.encode(dst)?;
    if let Some(will) = &connect.last_will {
        will.topic.encode(dst)?;
        will.message.encode(dst)?;
    }
    if let Some(username) = &connect.username {
        username.encode(dst)?;
    }
    if let Some(password) = &connect.password {
        password.encode(dst)?;
    }
    Ok(())
}
