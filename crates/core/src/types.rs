//! Identifiers shared across the broker crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broker (node) identifier within the cluster.
pub type BrokerId = i32;

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Directory name for this partition under `<data-dir>/topics/`.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Cleanup policy for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    #[default]
    Delete,
    Compact,
}

impl CleanupPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delete" => Some(Self::Delete),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Compact => "compact",
        }
    }
}

/// Fetch isolation level, from the wire `i8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadUncommitted,
    ReadCommitted,
}

impl IsolationLevel {
    pub fn from_i8(v: i8) -> Self {
        if v == 1 {
            Self::ReadCommitted
        } else {
            Self::ReadUncommitted
        }
    }
}

/// The sentinel producer id for non-idempotent producers.
pub const NO_PRODUCER_ID: i64 = -1;

/// Validates a topic name: charset `[a-zA-Z0-9._-]`, bounded length, and
/// not one of the filesystem-reserved names.
pub fn validate_topic_name(name: &str) -> crate::Result<()> {
    use std::sync::OnceLock;
    static LEGAL: OnceLock<regex::Regex> = OnceLock::new();
    let legal = LEGAL.get_or_init(|| regex::Regex::new(r"^[a-zA-Z0-9._-]+$").expect("topic regex"));

    if name.is_empty() || name.len() > crate::limits::MAX_TOPIC_NAME_LEN {
        return Err(crate::BrokerError::invalid_topic(format!(
            "topic name length must be in 1..={}",
            crate::limits::MAX_TOPIC_NAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(crate::BrokerError::invalid_topic("'.' and '..' are reserved"));
    }
    if !legal.is_match(name) {
        return Err(crate::BrokerError::invalid_topic(format!(
            "illegal characters in topic name {name:?}"
        )));
    }
    Ok(())
}

/// The internal offsets topic. Group coordination and offset commits are
/// persisted by appending to its partitions.
pub const CONSUMER_OFFSETS_TOPIC: &str = "__consumer_offsets";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_dir_name() {
        let tp = TopicPartition::new("orders", 3);
        assert_eq!(tp.dir_name(), "orders-3");
        assert_eq!(tp.to_string(), "orders-3");
    }

    #[test]
    fn test_cleanup_policy_parse() {
        assert_eq!(CleanupPolicy::parse("compact"), Some(CleanupPolicy::Compact));
        assert_eq!(CleanupPolicy::parse("delete"), Some(CleanupPolicy::Delete));
        assert_eq!(CleanupPolicy::parse("both"), None);
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("orders").is_ok());
        assert!(validate_topic_name("__consumer_offsets").is_ok());
        assert!(validate_topic_name("a.b-c_d").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name(".").is_err());
        assert!(validate_topic_name("..").is_err());
        assert!(validate_topic_name("bad topic").is_err());
        assert!(validate_topic_name(&"x".repeat(250)).is_err());
    }
}
