//! Topic names and topic filters

use std::fmt;
use std::str::FromStr;

use crate::error::ClientError;

/// One `/` separated level of a topic filter
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS
    Blank,
    SingleWildcard, // Single level wildcard +
    MultiWildcard,  // Multi-level wildcard #
}

impl Level {
    #[inline]
    fn is_valid(&self) -> bool {
        match self {
            Level::Normal(s) | Level::Metadata(s) => !s.contains(['+', '#']),
            _ => true,
        }
    }

    #[inline]
    fn match_str(&self, level: &str) -> bool {
        match self {
            Level::Normal(s) | Level::Metadata(s) => s == level,
            Level::Blank => level.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => true,
        }
    }
}

impl FromStr for Level {
    type Err = ClientError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, ClientError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(ClientError::InvalidTopic(format!("wildcard inside level `{}`", s)))
                } else if s.starts_with('$') {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Normal(s) | Level::Metadata(s) => f.write_str(s),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_str("+"),
            Level::MultiWildcard => f.write_str("#"),
        }
    }
}

/// A parsed topic filter, may contain `+` and `#`
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct TopicFilter(Vec<Level>);

impl TopicFilter {
    /// Parses and validates a filter: `#` only as the last level, wildcards only as whole levels.
    pub fn parse(filter: &str) -> Result<Self, ClientError> {
        if filter.is_empty() {
            return Err(ClientError::InvalidTopic("empty topic filter".into()));
        }
        if filter.len() > u16::MAX as usize || filter.contains('\0') {
            return Err(ClientError::InvalidTopic(format!("invalid topic filter `{}`", filter)));
        }
        let levels = filter.split('/').map(Level::from_str).collect::<Result<Vec<_>, _>>()?;
        let t = TopicFilter(levels);
        if !t.is_valid() {
            return Err(ClientError::InvalidTopic(format!("`#` must be the last level of `{}`", filter)));
        }
        Ok(t)
    }

    #[inline]
    fn is_valid(&self) -> bool {
        self.0.iter().all(Level::is_valid)
            && self.0.iter().position(|l| matches!(l, Level::MultiWildcard)).is_none_or(|pos| pos == self.0.len() - 1)
    }

    /// Whether a message published to `topic` is selected by this filter.
    ///
    /// Wildcards in the first level never select topics starting with `$`.
    pub fn matches_str(&self, topic: &str) -> bool {
        if topic.starts_with('$') && matches!(self.0.first(), Some(Level::SingleWildcard | Level::MultiWildcard)) {
            return false;
        }

        let mut lhs = self.0.iter();
        for rhs in topic.split('/') {
            match lhs.next() {
                Some(Level::MultiWildcard) => return true,
                Some(level) if level.match_str(rhs) => continue,
                _ => return false,
            }
        }

        // "a/#" also selects "a"
        match lhs.next() {
            Some(Level::MultiWildcard) => lhs.next().is_none(),
            Some(_) => false,
            None => true,
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in self.0.iter() {
            if !first {
                f.write_str("/")?;
            }
            first = false;
            write!(f, "{}", level)?;
        }
        Ok(())
    }
}

/// A topic name used for publishing must be non-empty and free of wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), ClientError> {
    if topic.is_empty() {
        return Err(ClientError::InvalidTopic("empty topic name".into()));
    }
    if topic.contains(['+', '#']) {
        return Err(ClientError::InvalidTopic(format!("wildcard in topic name `{}`", topic)));
    }
    if topic.len() > u16::MAX as usize || topic.contains('\0') {
        return Err(ClientError::InvalidTopic(format!("invalid topic name `{}`", topic)));
    }
    Ok(())
}
