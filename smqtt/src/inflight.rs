use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU16;
use std::time::Duration;

use itertools::Itertools;
use tokio::time::Instant;

use crate::types::{PacketId, Publish, PublishAck, Reply};

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum MomentStatus {
    /// QoS 1, waiting for PUBACK
    UnAck,
    /// QoS 2, waiting for PUBREC
    UnReceived,
    /// QoS 2, PUBREL sent, waiting for PUBCOMP
    UnComplete,
}

pub struct OutInflightMessage {
    pub publish: Publish,
    pub status: MomentStatus,
    /// Admission order, replays and retries follow it
    pub seq: u64,
    pub attempts: usize,
    pub update_time: Instant,
    /// Whether the PUBLISH went out at least once, later copies carry DUP
    pub transmitted: bool,
    pub(crate) reply: Option<Reply<PublishAck>>,
}

impl OutInflightMessage {
    #[inline]
    pub(crate) fn new(publish: Publish, seq: u64, reply: Option<Reply<PublishAck>>) -> Self {
        let status = if publish.qos == crate::types::QoS::ExactlyOnce {
            MomentStatus::UnReceived
        } else {
            MomentStatus::UnAck
        };
        Self { publish, status, seq, attempts: 0, update_time: Instant::now(), transmitted: false, reply }
    }

    #[inline]
    fn update_status(&mut self, status: MomentStatus, now: Instant) {
        self.update_time = now;
        self.status = status;
    }

    #[inline]
    pub fn packet_id(&self) -> Option<NonZeroU16> {
        self.publish.packet_id
    }

    #[inline]
    pub fn timeout(&self, interval: Duration, now: Instant) -> bool {
        !interval.is_zero() && now.saturating_duration_since(self.update_time) >= interval
    }

    /// Completes the waiting publish call, if it is still waiting.
    #[inline]
    pub(crate) fn complete(&mut self, res: Result<PublishAck, crate::ClientError>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(res);
        }
    }
}

impl std::fmt::Debug for OutInflightMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutInflightMessage")
            .field("packet_id", &self.publish.packet_id)
            .field("topic", &self.publish.topic)
            .field("qos", &self.publish.qos)
            .field("status", &self.status)
            .field("seq", &self.seq)
            .field("attempts", &self.attempts)
            .field("transmitted", &self.transmitted)
            .finish()
    }
}

/// Outbound QoS 1/2 messages that are not fully acknowledged, keyed by packet id
pub struct OutInflight {
    cap: usize,
    interval: Duration,
    queues: BTreeMap<PacketId, OutInflightMessage>,
}

impl OutInflight {
    /// `cap` of 0 means the whole packet id space, `retry_interval` of 0 disables retries.
    #[inline]
    pub fn new(cap: usize, retry_interval: Duration) -> Self {
        let cap = if cap == 0 { u16::MAX as usize } else { cap };
        Self { cap, interval: retry_interval, queues: BTreeMap::default() }
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&OutInflightMessage> {
        self.queues.get(&packet_id)
    }

    #[inline]
    pub fn get_mut(&mut self, packet_id: PacketId) -> Option<&mut OutInflightMessage> {
        self.queues.get_mut(&packet_id)
    }

    #[inline]
    pub fn insert(&mut self, m: OutInflightMessage) -> Option<OutInflightMessage> {
        if let Some(packet_id) = m.publish.packet_id {
            self.queues.insert(packet_id.get(), m)
        } else {
            log::warn!("packet_id is None, inflight message: {:?}", m);
            None
        }
    }

    #[inline]
    pub fn remove(&mut self, packet_id: &PacketId) -> Option<OutInflightMessage> {
        self.queues.remove(packet_id)
    }

    #[inline]
    pub fn update_status(&mut self, packet_id: &PacketId, s: MomentStatus, now: Instant) {
        if let Some(m) = self.queues.get_mut(packet_id) {
            m.update_status(s, now);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn exist(&self, packet_id: &PacketId) -> bool {
        self.queues.contains_key(packet_id)
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queues.len() < self.cap
    }

    /// Earliest instant at which an entry is due for retransmission
    #[inline]
    pub fn next_timeout(&self) -> Option<Instant> {
        if self.interval.is_zero() {
            return None;
        }
        self.queues.values().map(|m| m.update_time + self.interval).min()
    }

    /// Packet ids of entries due for retransmission, oldest admission first
    #[inline]
    pub fn timeouts(&self, now: Instant) -> Vec<PacketId> {
        self.queues
            .iter()
            .filter(|(_, m)| m.timeout(self.interval, now))
            .sorted_by_key(|(_, m)| m.seq)
            .map(|(id, _)| *id)
            .collect_vec()
    }

    /// Packet ids in admission order
    #[inline]
    pub fn ordered(&self) -> Vec<PacketId> {
        self.queues.iter().sorted_by_key(|(_, m)| m.seq).map(|(id, _)| *id).collect_vec()
    }

    #[inline]
    pub fn drain_all(&mut self) -> Vec<OutInflightMessage> {
        std::mem::take(&mut self.queues).into_values().sorted_by_key(|m| m.seq).collect_vec()
    }
}

/// Inbound QoS 2 packet ids received but not yet released
#[derive(Default)]
pub struct InInflight {
    cached: BTreeSet<NonZeroU16>,
}

impl InInflight {
    /// Returns `true` the first time `pid` is seen.
    #[inline]
    pub fn add(&mut self, pid: NonZeroU16) -> bool {
        self.cached.insert(pid)
    }

    #[inline]
    pub fn remove(&mut self, pid: &NonZeroU16) -> bool {
        self.cached.remove(pid)
    }

    #[inline]
    pub fn contains(&self, pid: &NonZeroU16) -> bool {
        self.cached.contains(pid)
    }

    #[inline]
    pub fn clear(&mut self) {
        self.cached.clear()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cached.len()
    }
}
