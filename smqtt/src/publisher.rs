use std::collections::VecDeque;
use std::num::NonZeroU16;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use tokio::time::Instant;

use smqtt_codec::types::MAX_PACKET_SIZE;
use smqtt_codec::v3::Packet;

use crate::error::ClientError;
use crate::inflight::{MomentStatus, OutInflight, OutInflightMessage};
use crate::topic::validate_topic_name;
use crate::types::{PacketId, Publish, PublishAck, QoS, Reply};

/// Checks a publish against the topic rules and the packet size limit.
///
/// A `max_packet_size` of 0 stands for the protocol maximum.
pub fn validate_publish(topic: &str, payload: &[u8], qos: QoS, max_packet_size: u32) -> Result<(), ClientError> {
    validate_topic_name(topic)?;
    let max = match max_packet_size {
        0 => MAX_PACKET_SIZE,
        n => n.min(MAX_PACKET_SIZE),
    } as usize;
    let packet_id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let size = 2 + topic.len() + packet_id_len + payload.len();
    if size > max {
        return Err(ClientError::PayloadTooLarge { size, max });
    }
    Ok(())
}

#[inline]
pub(crate) fn make_publish(topic: ByteString, payload: Bytes, qos: QoS, retain: bool) -> Publish {
    Publish { dup: false, retain, qos, topic, packet_id: None, payload }
}

struct Waiting {
    publish: Publish,
    reply: Option<Reply<PublishAck>>,
}

/// Outbound QoS 1/2 bookkeeping: the in-flight arena and the publishes waiting for a free slot
pub struct Publisher {
    inflight: OutInflight,
    waiting: VecDeque<Waiting>,
    next_seq: u64,
    retry_limit: usize,
}

impl Publisher {
    pub fn new(max_inflight: u16, retry_interval: Duration, retry_limit: usize) -> Self {
        Self {
            inflight: OutInflight::new(max_inflight as usize, retry_interval),
            waiting: VecDeque::new(),
            next_seq: 0,
            retry_limit,
        }
    }

    #[inline]
    pub fn inflight(&self) -> &OutInflight {
        &self.inflight
    }

    #[inline]
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.inflight.is_empty() && self.waiting.is_empty()
    }

    /// Queues a QoS 1/2 publish, it enters the arena once a slot and an identifier are free.
    #[inline]
    pub(crate) fn submit(&mut self, publish: Publish, reply: Option<Reply<PublishAck>>) {
        self.waiting.push_back(Waiting { publish, reply });
    }

    #[inline]
    pub fn can_admit(&self) -> bool {
        !self.waiting.is_empty() && self.inflight.has_credit()
    }

    /// Moves the oldest waiting publish into the arena under `packet_id`.
    pub(crate) fn admit(&mut self, packet_id: NonZeroU16, now: Instant) -> Option<&mut OutInflightMessage> {
        let Waiting { mut publish, reply } = self.waiting.pop_front()?;
        publish.packet_id = Some(packet_id);
        self.next_seq += 1;
        let mut msg = OutInflightMessage::new(publish, self.next_seq, reply);
        msg.update_time = now;
        self.inflight.insert(msg);
        self.inflight.get_mut(packet_id.get())
    }

    /// Fails the oldest waiting publish
    pub(crate) fn reject_waiting(&mut self, err: ClientError) {
        if let Some(Waiting { reply: Some(tx), .. }) = self.waiting.pop_front() {
            let _ = tx.send(Err(err));
        }
    }

    /// PUBACK, only completes a QoS 1 entry with the same identifier
    pub fn on_ack(&mut self, packet_id: NonZeroU16) -> bool {
        let id = packet_id.get();
        match self.inflight.get(id).map(|m| m.status) {
            Some(MomentStatus::UnAck) => {
                if let Some(mut msg) = self.inflight.remove(&id) {
                    log::debug!("publish {} acknowledged", id);
                    msg.complete(Ok(PublishAck { qos: QoS::AtLeastOnce, packet_id: Some(packet_id) }));
                }
                true
            }
            status => {
                log::warn!("PUBACK for unknown packet id {}, status: {:?}", id, status);
                false
            }
        }
    }

    /// PUBREC, returns whether a PUBREL must be sent.
    ///
    /// A repeated PUBREC does not advance the handshake, it only asks for the PUBREL again.
    pub fn on_received(&mut self, packet_id: NonZeroU16, now: Instant) -> bool {
        let id = packet_id.get();
        match self.inflight.get(id).map(|m| m.status) {
            Some(MomentStatus::UnReceived) => {
                self.inflight.update_status(&id, MomentStatus::UnComplete, now);
                true
            }
            Some(MomentStatus::UnComplete) => {
                log::debug!("repeated PUBREC for packet id {}", id);
                true
            }
            status => {
                log::warn!("PUBREC for unknown packet id {}, status: {:?}", id, status);
                false
            }
        }
    }

    /// PUBCOMP, completes a QoS 2 entry that has been released
    pub fn on_complete(&mut self, packet_id: NonZeroU16) -> bool {
        let id = packet_id.get();
        match self.inflight.get(id).map(|m| m.status) {
            Some(MomentStatus::UnComplete) => {
                if let Some(mut msg) = self.inflight.remove(&id) {
                    log::debug!("publish {} completed", id);
                    msg.complete(Ok(PublishAck { qos: QoS::ExactlyOnce, packet_id: Some(packet_id) }));
                }
                true
            }
            status => {
                log::warn!("PUBCOMP for unknown packet id {}, status: {:?}", id, status);
                false
            }
        }
    }

    /// Packets re-sending every in-flight operation, in submission order.
    ///
    /// Does not count toward the retry limit.
    pub fn replay(&mut self, now: Instant) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(self.inflight.len());
        for id in self.inflight.ordered() {
            if let Some(msg) = self.inflight.get_mut(id) {
                packets.push(Self::retransmission(msg));
                msg.transmitted = true;
                msg.update_time = now;
            }
        }
        packets
    }

    /// Retransmits or fails every entry whose retry interval has elapsed.
    pub fn retries(&mut self, now: Instant) -> Vec<Packet> {
        let mut packets = Vec::new();
        for id in self.inflight.timeouts(now) {
            let exhausted = self.inflight.get(id).map(|m| m.attempts >= self.retry_limit).unwrap_or(false);
            if exhausted {
                if let Some(mut msg) = self.inflight.remove(&id) {
                    log::warn!("publish {} not acknowledged after {} retries, {:?}", id, msg.attempts, msg);
                    if let Some(packet_id) = msg.packet_id() {
                        msg.complete(Err(ClientError::DeliveryFailed(packet_id)));
                    }
                }
            } else if let Some(msg) = self.inflight.get_mut(id) {
                msg.attempts += 1;
                msg.update_time = now;
                log::warn!("retransmit publish {}, attempt {}, status: {:?}", id, msg.attempts, msg.status);
                packets.push(Self::retransmission(msg));
                msg.transmitted = true;
            }
        }
        packets
    }

    fn retransmission(msg: &OutInflightMessage) -> Packet {
        match (msg.status, msg.packet_id()) {
            (MomentStatus::UnComplete, Some(packet_id)) => Packet::PublishRelease { packet_id },
            _ => {
                let mut publish = msg.publish.clone();
                publish.dup = msg.transmitted;
                Packet::Publish(publish)
            }
        }
    }

    #[inline]
    pub fn next_timeout(&self) -> Option<Instant> {
        self.inflight.next_timeout()
    }

    #[inline]
    pub fn contains(&self, packet_id: &PacketId) -> bool {
        self.inflight.exist(packet_id)
    }

    /// Fails every in-flight and waiting publish with `err`.
    pub fn fail_all(&mut self, err: ClientError) {
        for mut msg in self.inflight.drain_all() {
            msg.complete(Err(err.clone()));
        }
        for Waiting { reply, .. } in self.waiting.drain(..) {
            if let Some(tx) = reply {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }
}
