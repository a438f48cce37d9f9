use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use smqtt::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Green,
    Yellow,
    Red,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Green => "green",
            Status::Yellow => "yellow",
            Status::Red => "red",
        };
        f.write_str(s)
    }
}

/// Reading published by `smqtt-pub`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub message_id: u64,
    pub timestamp: String,
    pub value: u8,
    pub status: Status,
}

impl Sample {
    pub fn generate<R: Rng + ?Sized>(message_id: u64, rng: &mut R) -> Self {
        let status = match rng.random_range(0..3) {
            0 => Status::Green,
            1 => Status::Yellow,
            _ => Status::Red,
        };
        Sample {
            message_id,
            timestamp: smqtt_utils::format_timestamp_now(),
            value: rng.random_range(0..=100),
            status,
        }
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    #[inline]
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    #[inline]
    pub fn is_alert(&self) -> bool {
        self.status == Status::Red
    }
}

/// Logs one received message, payloads that are not a [`Sample`] are skipped.
pub fn report(msg: &Message) {
    let received = smqtt_utils::format_timestamp_now();
    let sample = match Sample::from_slice(&msg.payload) {
        Ok(sample) => sample,
        Err(e) => {
            log::warn!("skipping message on {}, {}", msg.topic, e);
            return;
        }
    };
    log::info!("Received message on {} at {}", msg.topic, received);
    log::info!("  message_id: {}", sample.message_id);
    log::info!("  timestamp: {}", sample.timestamp);
    log::info!("  value: {}", sample.value);
    log::info!("  status: {}", sample.status);
    if sample.is_alert() {
        log::warn!("ALERT: Red status detected!");
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_generate() {
        let mut rng = StdRng::seed_from_u64(7);
        for id in 1..=200 {
            let sample = Sample::generate(id, &mut rng);
            assert_eq!(sample.message_id, id);
            assert!(sample.value <= 100);
            assert!(chrono::NaiveDateTime::parse_from_str(&sample.timestamp, "%Y-%m-%d %H:%M:%S").is_ok());
        }
    }

    #[test]
    fn test_json_layout() {
        let sample = Sample { message_id: 3, timestamp: "2024-05-01 10:00:00".into(), value: 42, status: Status::Red };
        assert_eq!(
            sample.to_json().unwrap(),
            r#"{"message_id":3,"timestamp":"2024-05-01 10:00:00","value":42,"status":"red"}"#
        );
        assert!(sample.is_alert());
    }

    #[test]
    fn test_from_slice() {
        let sample =
            Sample::from_slice(br#"{"message_id":1,"timestamp":"t","value":7,"status":"yellow"}"#).unwrap();
        assert_eq!(sample.status, Status::Yellow);
        assert!(!sample.is_alert());

        assert!(Sample::from_slice(br#"{"message_id":1,"value":7,"status":"green"}"#).is_err());
        assert!(Sample::from_slice(br#"{"message_id":1,"timestamp":"t","value":7,"status":"blue"}"#).is_err());
        assert!(Sample::from_slice(b"not json").is_err());
    }
}
