use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU16;
use std::sync::Arc;

use bytestring::ByteString;
use tokio::time::Instant;

use smqtt_codec::v3::{Packet, SubscribeReturnCode};

use crate::error::ClientError;
use crate::inflight::InInflight;
use crate::topic::TopicFilter;
use crate::types::{Handler, Message, PacketId, Publish, QoS, Reply};

/// An acknowledged subscription
#[derive(Clone)]
pub struct Subscription {
    pub filter: TopicFilter,
    /// Requested QoS, re-requested on resubscribe
    pub qos: QoS,
    /// QoS granted by the broker, caps the delivered QoS
    pub granted: QoS,
    handler: Handler,
}

impl Subscription {
    #[inline]
    pub(crate) fn handler(&self) -> Handler {
        self.handler.clone()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter.to_string())
            .field("qos", &self.qos)
            .field("granted", &self.granted)
            .finish()
    }
}

struct PendingSubscribe {
    topic: ByteString,
    filter: TopicFilter,
    qos: QoS,
    handler: Handler,
    // None for resubscribes issued after a reconnection
    reply: Option<Reply<QoS>>,
    deadline: Instant,
    // unsubscribed before the SUBACK arrived, the grant must not reactivate it
    cancelled: bool,
}

struct PendingUnsubscribe {
    topic: ByteString,
    reply: Option<Reply<()>>,
    deadline: Instant,
}

/// Active subscriptions, outstanding SUBSCRIBE/UNSUBSCRIBE requests and the inbound QoS 2 seen-set
#[derive(Default)]
pub struct Subscriber {
    subscriptions: HashMap<ByteString, Subscription>,
    subscribes: BTreeMap<PacketId, PendingSubscribe>,
    unsubscribes: BTreeMap<PacketId, PendingUnsubscribe>,
    incoming: InInflight,
}

impl Subscriber {
    /// Active subscriptions, keyed by topic filter
    #[inline]
    pub fn active_subscriptions(&self) -> impl Iterator<Item = (&ByteString, &Subscription)> {
        self.subscriptions.iter()
    }

    #[inline]
    pub fn contains(&self, packet_id: &PacketId) -> bool {
        self.subscribes.contains_key(packet_id) || self.unsubscribes.contains_key(packet_id)
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.subscribes.len() + self.unsubscribes.len()
    }

    pub(crate) fn subscribe(
        &mut self,
        packet_id: NonZeroU16,
        topic: ByteString,
        filter: TopicFilter,
        qos: QoS,
        handler: Handler,
        reply: Option<Reply<QoS>>,
        deadline: Instant,
    ) -> Packet {
        let packet = Packet::Subscribe { packet_id, topic_filters: vec![(topic.clone(), qos)] };
        let pending = PendingSubscribe { topic, filter, qos, handler, reply, deadline, cancelled: false };
        self.subscribes.insert(packet_id.get(), pending);
        packet
    }

    /// Stops local delivery for `topic` at once, the broker is told with the returned packet.
    ///
    /// A SUBSCRIBE for the same topic still waiting for its SUBACK is cancelled too.
    pub(crate) fn unsubscribe(
        &mut self,
        packet_id: NonZeroU16,
        topic: ByteString,
        reply: Option<Reply<()>>,
        deadline: Instant,
    ) -> Packet {
        self.subscriptions.remove(&topic);
        for pending in self.subscribes.values_mut().filter(|s| s.topic == topic) {
            pending.cancelled = true;
        }
        let packet = Packet::Unsubscribe { packet_id, topic_filters: vec![topic.clone()] };
        self.unsubscribes.insert(packet_id.get(), PendingUnsubscribe { topic, reply, deadline });
        packet
    }

    pub fn on_subscribe_ack(&mut self, packet_id: NonZeroU16, status: &[SubscribeReturnCode]) {
        let Some(pending) = self.subscribes.remove(&packet_id.get()) else {
            log::warn!("SUBACK for unknown packet id {}", packet_id);
            return;
        };
        match status.first() {
            Some(SubscribeReturnCode::Success(granted)) if pending.cancelled => {
                log::debug!("SUBACK for {} after unsubscribe, not activated", pending.topic);
                if let Some(tx) = pending.reply {
                    let _ = tx.send(Ok(*granted));
                }
            }
            Some(SubscribeReturnCode::Success(granted)) => {
                let granted = *granted;
                if granted != pending.qos {
                    log::info!("subscription {} downgraded from qos {} to {}", pending.topic, pending.qos, granted);
                } else {
                    log::info!("subscribed to {}, qos {}", pending.topic, granted);
                }
                self.subscriptions.insert(
                    pending.topic.clone(),
                    Subscription { filter: pending.filter, qos: pending.qos, granted, handler: pending.handler },
                );
                if let Some(tx) = pending.reply {
                    let _ = tx.send(Ok(granted));
                }
            }
            Some(SubscribeReturnCode::Failure) | None => {
                log::error!("subscription {} refused by the broker", pending.topic);
                self.subscriptions.remove(&pending.topic);
                if let Some(tx) = pending.reply {
                    let _ = tx.send(Err(ClientError::SubscribeFailed(pending.topic.to_string())));
                }
            }
        }
    }

    pub fn on_unsubscribe_ack(&mut self, packet_id: NonZeroU16) {
        match self.unsubscribes.remove(&packet_id.get()) {
            Some(pending) => {
                log::info!("unsubscribed from {}", pending.topic);
                if let Some(tx) = pending.reply {
                    let _ = tx.send(Ok(()));
                }
            }
            None => log::warn!("UNSUBACK for unknown packet id {}", packet_id),
        }
    }

    /// Hands an inbound PUBLISH to every matching handler.
    ///
    /// Returns `false` for a QoS 2 packet id already seen, the handlers are not called again.
    pub fn deliver(&mut self, publish: &Publish) -> bool {
        if publish.qos == QoS::ExactlyOnce {
            if let Some(packet_id) = publish.packet_id {
                if !self.incoming.add(packet_id) {
                    log::debug!("duplicate qos 2 publish {}, not delivered again", packet_id);
                    return false;
                }
            }
        }

        let active = self.subscriptions.values().map(|s| (&s.filter, s.granted, &s.handler));
        let pending = self.subscribes.values().filter(|s| !s.cancelled).map(|s| (&s.filter, s.qos, &s.handler));
        let mut delivered: Vec<&Handler> = Vec::new();
        for (filter, granted, handler) in active.chain(pending) {
            if !filter.matches_str(&publish.topic) || delivered.iter().any(|h| Arc::ptr_eq(*h, handler)) {
                continue;
            }
            let msg = Message {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos.less_value(granted),
                retain: publish.retain,
                dup: publish.dup,
                packet_id: publish.packet_id,
            };
            handler.on_message(&msg);
            delivered.push(handler);
        }
        if delivered.is_empty() {
            log::debug!("no subscription for message on {}", publish.topic);
        }
        true
    }

    /// PUBREL for an inbound QoS 2 message, the id may be reused by the broker afterwards
    #[inline]
    pub fn release(&mut self, packet_id: &NonZeroU16) -> bool {
        self.incoming.remove(packet_id)
    }

    /// A new broker session remembers neither subscriptions nor inbound QoS 2 state.
    ///
    /// Returns the topics of active subscriptions that need a fresh SUBSCRIBE.
    pub fn reset_session(&mut self) -> Vec<(ByteString, Subscription)> {
        self.incoming.clear();
        let pending = self.subscribes.values().map(|s| s.topic.clone()).collect::<Vec<_>>();
        self.subscriptions
            .iter()
            .filter(|(topic, _)| !pending.contains(topic))
            .map(|(topic, s)| (topic.clone(), s.clone()))
            .collect()
    }

    /// SUBSCRIBE/UNSUBSCRIBE packets still waiting for their acknowledgement
    pub fn pending_requests(&self) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(self.pending_len());
        for (id, s) in self.subscribes.iter() {
            if let Some(packet_id) = NonZeroU16::new(*id) {
                packets.push(Packet::Subscribe { packet_id, topic_filters: vec![(s.topic.clone(), s.qos)] });
            }
        }
        for (id, s) in self.unsubscribes.iter() {
            if let Some(packet_id) = NonZeroU16::new(*id) {
                packets.push(Packet::Unsubscribe { packet_id, topic_filters: vec![s.topic.clone()] });
            }
        }
        packets
    }

    #[inline]
    pub fn next_timeout(&self) -> Option<Instant> {
        self.subscribes.values().map(|s| s.deadline).chain(self.unsubscribes.values().map(|s| s.deadline)).min()
    }

    /// Fails requests whose acknowledgement did not arrive in time
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired = self.subscribes.iter().filter(|(_, s)| s.deadline <= now).map(|(id, _)| *id).collect::<Vec<_>>();
        for id in expired {
            if let Some(s) = self.subscribes.remove(&id) {
                log::warn!("SUBACK for {} not received in time, packet id {}", s.topic, id);
                if let Some(tx) = s.reply {
                    let _ = tx.send(Err(ClientError::Timeout));
                }
            }
        }
        let expired =
            self.unsubscribes.iter().filter(|(_, s)| s.deadline <= now).map(|(id, _)| *id).collect::<Vec<_>>();
        for id in expired {
            if let Some(s) = self.unsubscribes.remove(&id) {
                log::warn!("UNSUBACK for {} not received in time, packet id {}", s.topic, id);
                if let Some(tx) = s.reply {
                    let _ = tx.send(Err(ClientError::Timeout));
                }
            }
        }
    }

    /// Fails every outstanding request with `err`, active subscriptions are kept.
    pub fn fail_all(&mut self, err: ClientError) {
        for (_, s) in std::mem::take(&mut self.subscribes) {
            if let Some(tx) = s.reply {
                let _ = tx.send(Err(err.clone()));
            }
        }
        for (_, s) in std::mem::take(&mut self.unsubscribes) {
            if let Some(tx) = s.reply {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    use super::*;

    fn pid(id: u16) -> NonZeroU16 {
        NonZeroU16::new(id).unwrap()
    }

    fn publish(topic: &str, qos: QoS, id: Option<u16>, dup: bool) -> Publish {
        Publish {
            dup,
            retain: false,
            qos,
            topic: ByteString::from(topic),
            packet_id: id.and_then(NonZeroU16::new),
            payload: Bytes::from_static(b"{}"),
        }
    }

    fn subscribe(
        s: &mut Subscriber,
        id: u16,
        topic: &str,
        qos: QoS,
        handler: Handler,
    ) -> oneshot::Receiver<Result<QoS, ClientError>> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(30);
        s.subscribe(pid(id), topic.into(), TopicFilter::parse(topic).unwrap(), qos, handler, Some(tx), deadline);
        rx
    }

    #[tokio::test]
    async fn test_granted_qos_caps_delivery() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        let handler: Handler = Arc::new(move |msg: &Message| r.lock().push(msg.clone()));

        let mut s = Subscriber::default();
        let rx = subscribe(&mut s, 1, "signals/+", QoS::ExactlyOnce, handler);
        s.on_subscribe_ack(pid(1), &[SubscribeReturnCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(rx.await.unwrap(), Ok(QoS::AtLeastOnce));

        assert!(s.deliver(&publish("signals/test", QoS::ExactlyOnce, Some(5), false)));
        assert!(s.deliver(&publish("other/test", QoS::AtMostOnce, None, false)));

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].qos, QoS::AtLeastOnce);
        assert_eq!(received[0].topic, "signals/test");
        assert_eq!(received[0].packet_id, Some(pid(5)));
    }

    #[test]
    fn test_qos2_delivered_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler: Handler = Arc::new(move |_: &Message| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut s = Subscriber::default();
        let _rx = subscribe(&mut s, 1, "test/topic", QoS::ExactlyOnce, handler);
        s.on_subscribe_ack(pid(1), &[SubscribeReturnCode::Success(QoS::ExactlyOnce)]);

        assert!(s.deliver(&publish("test/topic", QoS::ExactlyOnce, Some(11), false)));
        assert!(!s.deliver(&publish("test/topic", QoS::ExactlyOnce, Some(11), true)));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(s.release(&pid(11)));
        assert!(!s.release(&pid(11)));
        assert!(s.deliver(&publish("test/topic", QoS::ExactlyOnce, Some(11), false)));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // QoS 1 duplicates are delivered again
        assert!(s.deliver(&publish("test/topic", QoS::AtLeastOnce, Some(12), false)));
        assert!(s.deliver(&publish("test/topic", QoS::AtLeastOnce, Some(12), true)));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_subscribe_failure_and_unsubscribe() {
        let handler: Handler = Arc::new(|_: &Message| {});
        let mut s = Subscriber::default();
        let rx = subscribe(&mut s, 1, "forbidden/#", QoS::AtLeastOnce, handler.clone());
        assert!(s.contains(&1));
        s.on_subscribe_ack(pid(1), &[SubscribeReturnCode::Failure]);
        assert_eq!(rx.await.unwrap(), Err(ClientError::SubscribeFailed("forbidden/#".into())));
        assert_eq!(s.active_subscriptions().count(), 0);

        let _rx = subscribe(&mut s, 2, "a/b", QoS::AtLeastOnce, handler);
        s.on_subscribe_ack(pid(2), &[SubscribeReturnCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(s.active_subscriptions().count(), 1);

        let (tx, rx) = oneshot::channel();
        let packet = s.unsubscribe(pid(3), "a/b".into(), Some(tx), Instant::now() + Duration::from_secs(30));
        assert_eq!(packet, Packet::Unsubscribe { packet_id: pid(3), topic_filters: vec!["a/b".into()] });
        assert_eq!(s.active_subscriptions().count(), 0);
        s.on_unsubscribe_ack(pid(3));
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(s.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_before_suback() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler: Handler = Arc::new(move |_: &Message| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut s = Subscriber::default();
        let sub = subscribe(&mut s, 1, "a/b", QoS::AtLeastOnce, handler);
        let (tx, unsub) = oneshot::channel();
        s.unsubscribe(pid(2), "a/b".into(), Some(tx), Instant::now() + Duration::from_secs(30));
        assert!(s.deliver(&publish("a/b", QoS::AtMostOnce, None, false)));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        s.on_subscribe_ack(pid(1), &[SubscribeReturnCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(sub.await.unwrap(), Ok(QoS::AtLeastOnce));
        s.on_unsubscribe_ack(pid(2));
        assert_eq!(unsub.await.unwrap(), Ok(()));

        assert_eq!(s.active_subscriptions().count(), 0);
        assert!(s.reset_session().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let handler: Handler = Arc::new(|_: &Message| {});
        let mut s = Subscriber::default();
        let rx = subscribe(&mut s, 1, "a/b", QoS::AtLeastOnce, handler);
        assert_eq!(s.next_timeout(), Some(Instant::now() + Duration::from_secs(30)));
        assert_eq!(s.pending_requests().len(), 1);

        tokio::time::advance(Duration::from_secs(29)).await;
        s.handle_timeout(Instant::now());
        assert_eq!(s.pending_len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        s.handle_timeout(Instant::now());
        assert_eq!(rx.await.unwrap(), Err(ClientError::Timeout));
        assert_eq!(s.next_timeout(), None);
    }

    #[test]
    fn test_reset_session() {
        let handler: Handler = Arc::new(|_: &Message| {});
        let mut s = Subscriber::default();
        let _a = subscribe(&mut s, 1, "a", QoS::AtLeastOnce, handler.clone());
        s.on_subscribe_ack(pid(1), &[SubscribeReturnCode::Success(QoS::AtLeastOnce)]);
        let _b = subscribe(&mut s, 2, "b", QoS::AtLeastOnce, handler);
        s.deliver(&publish("a", QoS::ExactlyOnce, Some(4), false));

        let resubscribe = s.reset_session();
        assert_eq!(resubscribe.len(), 1);
        assert_eq!(resubscribe[0].0, "a");
        // the seen-set was cleared
        assert!(!s.release(&pid(4)));
    }
}
