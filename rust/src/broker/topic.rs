use std::fmt;

use thiserror::Error;

/// Cluster-wide routing key for a topic: CRC-32C of the raw topic bytes.
///
/// Every node must derive the same key for the same topic, so the hash is
/// fixed and never configurable. Distinct topics that collide share a key
/// and therefore share subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey(pub u32);

impl TopicKey {
    pub fn of(topic: &[u8]) -> Self {
        TopicKey(crc32c::crc32c(topic))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("wildcard topics are not supported")]
    Wildcard,
    #[error("topic contains a NUL character")]
    Nul,
}

/// Only exact-match topics are routable.
pub fn validate_topic(topic: &[u8]) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    for b in topic {
        match b {
            b'+' | b'#' => return Err(TopicError::Wildcard),
            0 => return Err(TopicError::Nul),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(TopicKey::of(b"sensors/temp"), TopicKey::of(b"sensors/temp"));
        assert_ne!(TopicKey::of(b"sensors/temp"), TopicKey::of(b"sensors/hum"));
    }

    #[test]
    fn test_key_matches_crc32c() {
        // Well-known CRC-32C check value.
        assert_eq!(TopicKey::of(b"123456789").0, 0xE306_9283);
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic(b"alerts").is_ok());
        assert!(validate_topic(b"a/b/c").is_ok());
        assert_eq!(validate_topic(b""), Err(TopicError::Empty));
        assert_eq!(validate_topic(b"a/+/c"), Err(TopicError::Wildcard));
        assert_eq!(validate_topic(b"a/#"), Err(TopicError::Wildcard));
        assert_eq!(validate_topic(b"a\0b"), Err(TopicError::Nul));
    }
}
