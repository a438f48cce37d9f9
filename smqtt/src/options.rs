use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;

use smqtt_conf::Settings;

use crate::types::{LastWill, QoS};

/// Reconnection backoff, see [`crate::Supervisor`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectOptions {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// 0 disables jitter
    pub randomization_factor: f64,
    /// Consecutive failed attempts before giving up, 0 retries forever
    pub max_attempts: usize,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            randomization_factor: 0.2,
            max_attempts: 10,
        }
    }
}

/// Session parameters of a [`crate::Client`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: ByteString,
    /// Zero disables keepalive pinging
    pub keepalive: Duration,
    pub clean_session: bool,
    /// Bound for the CONNACK after CONNECT was sent
    pub connect_timeout: Duration,
    /// Bound for writing one packet
    pub send_timeout: Duration,
    /// Bound for SUBACK and UNSUBACK
    pub ack_timeout: Duration,
    /// Largest packet accepted from the broker and published to it, 0 is the protocol maximum
    pub max_packet_size: u32,
    /// Unacknowledged QoS 1/2 publishes allowed at once, 0 is the whole packet id space
    pub max_inflight: u16,
    pub retry_interval: Duration,
    pub retry_limit: usize,
    pub reconnect: ReconnectOptions,
    pub command_channel_capacity: usize,
    pub last_will: Option<LastWill>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: ByteString::new(),
            keepalive: Duration::from_secs(60),
            clean_session: true,
            connect_timeout: Duration::from_secs(20),
            send_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            max_packet_size: 1024 * 1024,
            max_inflight: 16,
            retry_interval: Duration::from_secs(10),
            retry_limit: 3,
            reconnect: ReconnectOptions::default(),
            command_channel_capacity: 1024,
            last_will: None,
        }
    }
}

impl ClientOptions {
    pub fn new(client_id: impl Into<ByteString>) -> Self {
        Self { client_id: client_id.into(), ..Default::default() }
    }

    /// Session parameters from the `[client]`, `[retry]` and `[reconnect]` sections
    pub fn from_settings(settings: &Settings, client_id: impl Into<ByteString>) -> Self {
        let reconnect = ReconnectOptions {
            initial_interval: settings.reconnect.initial_interval,
            max_interval: settings.reconnect.max_interval,
            multiplier: settings.reconnect.multiplier,
            randomization_factor: settings.reconnect.randomization_factor,
            max_attempts: settings.reconnect.max_attempts,
        };
        Self::new(client_id)
            .keepalive(settings.client.keepalive)
            .clean_session(settings.client.clean_session)
            .connect_timeout(settings.client.connect_timeout)
            .send_timeout(settings.client.send_timeout)
            .ack_timeout(settings.client.ack_timeout)
            .max_packet_size(settings.client.max_packet_size.as_u32())
            .max_inflight(settings.client.max_inflight)
            .retry_interval(settings.retry.interval)
            .retry_limit(settings.retry.limit)
            .reconnect(reconnect)
    }

    #[inline]
    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    #[inline]
    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[inline]
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[inline]
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    #[inline]
    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    #[inline]
    pub fn max_inflight(mut self, max_inflight: u16) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    #[inline]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[inline]
    pub fn retry_limit(mut self, limit: usize) -> Self {
        self.retry_limit = limit;
        self
    }

    #[inline]
    pub fn reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[inline]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity.max(1);
        self
    }

    /// Message the broker publishes on our behalf when the connection drops without DISCONNECT
    #[inline]
    pub fn last_will(mut self, topic: impl Into<ByteString>, message: Bytes, qos: QoS, retain: bool) -> Self {
        self.last_will = Some(LastWill { qos, retain, topic: topic.into(), message });
        self
    }

    /// Keepalive in whole seconds as carried by CONNECT
    #[inline]
    pub(crate) fn keepalive_secs(&self) -> u16 {
        self.keepalive.as_secs().min(u16::MAX as u64) as u16
    }
}
