//! Small helpers shared by the smqtt crates
//!
//! - [`Bytesize`] and [`to_bytesize`]: sizes written as `512K`, `1M`, `2G512M`
//! - [`to_duration`] and [`deserialize_duration`]: durations written as `500ms`, `1m30s`
//! - wall clock timestamps and their `%Y-%m-%d %H:%M:%S` rendering
//!
//! ```rust
//! use smqtt_utils::{to_duration, Bytesize};
//!
//! assert_eq!(Bytesize::from("1M").as_usize(), 1_048_576);
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::TimeZone;
use serde::de::Deserializer;
use serde::Deserialize;

/// Seconds since the Unix epoch
pub type Timestamp = i64;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Sums `<number><unit>` groups, e.g. `2G512M`.
///
/// A group with an unknown unit or an unparsable number contributes nothing.
fn sum_units(text: &str, units: &[char], scale: impl Fn(char) -> u64) -> u64 {
    text.split_inclusive(units)
        .filter_map(|group| {
            let unit = group.chars().last()?;
            let number = group[..group.len() - unit.len_utf8()].trim().parse::<u64>().ok()?;
            number.checked_mul(scale(unit))
        })
        .fold(0u64, u64::saturating_add)
}

/// Parses a size such as `256KB` or `1G500M` into bytes
///
/// ```
/// assert_eq!(smqtt_utils::to_bytesize("2G512K"), 2_148_007_936);
/// assert_eq!(smqtt_utils::to_bytesize("1024B"), 1024);
/// ```
pub fn to_bytesize(text: &str) -> usize {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    let bytes = sum_units(&text, &['G', 'M', 'K', 'B'], |unit| match unit {
        'G' => GIB,
        'M' => MIB,
        'K' => KIB,
        'B' => 1,
        _ => 0,
    });
    usize::try_from(bytes).unwrap_or(usize::MAX)
}

/// A byte count read from configuration
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    /// Saturates at `u32::MAX`
    #[inline]
    pub fn as_u32(&self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.0 as u64;
        if rest == 0 {
            return write!(f, "0B");
        }
        for (unit, scale) in [('G', GIB), ('M', MIB), ('K', KIB), ('B', 1)] {
            if rest >= scale {
                write!(f, "{}{}", rest / scale, unit)?;
                rest %= scale;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(usize),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => Bytesize(n),
            Raw::Text(text) => Bytesize::from(text.as_str()),
        })
    }
}

/// Parses a duration such as `30s`, `1h30m` or `250ms`
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. A bare number or unknown text yields zero.
///
/// ```
/// assert_eq!(smqtt_utils::to_duration("1h30m15s").as_secs(), 5415);
/// assert_eq!(smqtt_utils::to_duration("250ms").as_millis(), 250);
/// ```
pub fn to_duration(text: &str) -> Duration {
    // `m` alone is minutes, so milliseconds get a placeholder unit first
    let text = text.to_lowercase().replace("ms", "u");
    let millis = sum_units(&text, &['u', 's', 'm', 'h', 'd', 'w'], |unit| match unit {
        'u' => 1,
        's' => 1_000,
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        'w' => 604_800_000,
        _ => 0,
    });
    Duration::from_millis(millis)
}

/// `deserialize_with` adapter for [`to_duration`]
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    Ok(to_duration(&text))
}

/// `deserialize_with` adapter for optional file paths, a blank string counts as unset
pub fn deserialize_path_option<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let path = Option::<String>::deserialize(deserializer)?;
    Ok(path.filter(|p| !p.trim().is_empty()))
}

#[inline]
pub fn timestamp_secs() -> Timestamp {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as Timestamp,
        Err(_) => chrono::Local::now().timestamp(),
    }
}

/// Local time as `%Y-%m-%d %H:%M:%S`, empty for non-positive or ambiguous timestamps
pub fn format_timestamp(t: Timestamp) -> String {
    if t <= 0 {
        return String::new();
    }
    match chrono::Local.timestamp_opt(t, 0) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => String::new(),
    }
}

#[inline]
pub fn format_timestamp_now() -> String {
    format_timestamp(timestamp_secs())
}
