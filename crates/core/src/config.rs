//! Broker configuration.
//!
//! Every key has a struct default, can be set from a TOML file, and accepts
//! an environment override via `BROKER__<SECTION>__<KEY>`.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use crate::types::CleanupPolicy;

/// Deserialize listeners/peers as either a comma-separated string or a list.
fn deserialize_addrs<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct AddrsVisitor;

    impl<'de> Visitor<'de> for AddrsVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a comma-separated string or a list of addresses")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value.trim().is_empty() {
                return Ok(Vec::new());
            }
            Ok(value.split(',').map(|s| s.trim().to_string()).collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut addrs = Vec::new();
            while let Some(addr) = seq.next_element::<String>()? {
                addrs.push(addr);
            }
            Ok(addrs)
        }
    }

    deserializer.deserialize_any(AddrsVisitor)
}

/// When acknowledged writes hit the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// fsync before every acknowledgement. Durable, slower.
    #[default]
    Ack,
    /// fsync every `flush_interval_ms` or `flush_messages`, whichever first.
    Interval,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Active segment rolls when it exceeds this many bytes
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u64,
    /// Active segment rolls when older than this
    #[serde(default = "default_segment_ms")]
    pub segment_ms: i64,
    /// A sparse index entry is written every this many log bytes
    #[serde(default = "default_index_interval_bytes")]
    pub index_interval_bytes: u32,
    /// Records older than this are eligible for deletion (-1 = unbounded)
    #[serde(default = "default_retention_ms")]
    pub retention_ms: i64,
    /// Partition size above which oldest segments are deleted (-1 = unbounded)
    #[serde(default = "default_retention_bytes")]
    pub retention_bytes: i64,
    /// Largest record batch accepted from a producer
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Flush policy for acknowledged writes
    #[serde(default)]
    pub flush_mode: FlushMode,
    /// Interval flush period (FlushMode::Interval)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Interval flush message count (FlushMode::Interval)
    #[serde(default = "default_flush_messages")]
    pub flush_messages: u64,
    /// How often each partition runs roll/retention/compaction checks
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    /// Tombstones survive compaction for at least this long
    #[serde(default = "default_delete_retention_ms")]
    pub delete_retention_ms: i64,
    /// Idle producer state is evicted after this long
    #[serde(default = "default_producer_id_expiration_ms")]
    pub producer_id_expiration_ms: i64,
}

fn default_segment_bytes() -> u64 {
    128 * 1024 * 1024
}

fn default_segment_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_index_interval_bytes() -> u32 {
    4096
}

fn default_retention_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_retention_bytes() -> i64 {
    -1
}

fn default_max_message_bytes() -> usize {
    crate::limits::DEFAULT_MAX_MESSAGE_BYTES
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_flush_messages() -> u64 {
    10_000
}

fn default_maintenance_interval_ms() -> u64 {
    30_000
}

fn default_delete_retention_ms() -> i64 {
    24 * 60 * 60 * 1000
}

fn default_producer_id_expiration_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            segment_bytes: default_segment_bytes(),
            segment_ms: default_segment_ms(),
            index_interval_bytes: default_index_interval_bytes(),
            retention_ms: default_retention_ms(),
            retention_bytes: default_retention_bytes(),
            max_message_bytes: default_max_message_bytes(),
            flush_mode: FlushMode::default(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_messages: default_flush_messages(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            delete_retention_ms: default_delete_retention_ms(),
            producer_id_expiration_ms: default_producer_id_expiration_ms(),
        }
    }
}

/// Per-topic overridable configuration, resolved at topic creation from the
/// broker defaults plus the CreateTopics config map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub retention_ms: i64,
    pub retention_bytes: i64,
    pub segment_bytes: u64,
    pub segment_ms: i64,
    pub cleanup_policy: CleanupPolicy,
    pub min_insync_replicas: i16,
    pub delete_retention_ms: i64,
    pub max_message_bytes: usize,
}

impl TopicConfig {
    /// Base topic config from the broker storage defaults.
    pub fn from_storage(storage: &StorageConfig) -> Self {
        Self {
            retention_ms: storage.retention_ms,
            retention_bytes: storage.retention_bytes,
            segment_bytes: storage.segment_bytes,
            segment_ms: storage.segment_ms,
            cleanup_policy: CleanupPolicy::Delete,
            min_insync_replicas: 1,
            delete_retention_ms: storage.delete_retention_ms,
            max_message_bytes: storage.max_message_bytes,
        }
    }

    /// Applies a `CreateTopics`/`AlterConfigs` key. Unknown keys error.
    pub fn set(&mut self, key: &str, value: &str) -> crate::Result<()> {
        let invalid =
            |k: &str, v: &str| crate::BrokerError::InvalidConfig(format!("{k}={v}"));
        match key {
            "retention.ms" => {
                self.retention_ms = value.parse().map_err(|_| invalid(key, value))?
            }
            "retention.bytes" => {
                self.retention_bytes = value.parse().map_err(|_| invalid(key, value))?
            }
            "segment.bytes" => {
                self.segment_bytes = value.parse().map_err(|_| invalid(key, value))?
            }
            "segment.ms" => self.segment_ms = value.parse().map_err(|_| invalid(key, value))?,
            "cleanup.policy" => {
                self.cleanup_policy =
                    CleanupPolicy::parse(value).ok_or_else(|| invalid(key, value))?
            }
            "min.insync.replicas" => {
                self.min_insync_replicas = value.parse().map_err(|_| invalid(key, value))?
            }
            "delete.retention.ms" => {
                self.delete_retention_ms = value.parse().map_err(|_| invalid(key, value))?
            }
            "max.message.bytes" => {
                self.max_message_bytes = value.parse().map_err(|_| invalid(key, value))?
            }
            _ => return Err(invalid(key, value)),
        }
        Ok(())
    }

    /// The config map served by `DescribeConfigs`.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("retention.ms", self.retention_ms.to_string()),
            ("retention.bytes", self.retention_bytes.to_string()),
            ("segment.bytes", self.segment_bytes.to_string()),
            ("segment.ms", self.segment_ms.to_string()),
            ("cleanup.policy", self.cleanup_policy.as_str().to_string()),
            ("min.insync.replicas", self.min_insync_replicas.to_string()),
            ("delete.retention.ms", self.delete_retention_ms.to_string()),
            ("max.message.bytes", self.max_message_bytes.to_string()),
        ]
    }
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// A follower drops from ISR after this long without a caught-up fetch
    #[serde(default = "default_replica_lag_time_max_ms")]
    pub replica_lag_time_max_ms: u64,
    /// Follower fetch long-poll wait
    #[serde(default = "default_replica_fetch_wait_ms")]
    pub replica_fetch_wait_ms: u64,
    /// Follower fetch max bytes per partition
    #[serde(default = "default_replica_fetch_max_bytes")]
    pub replica_fetch_max_bytes: i32,
    /// Allow electing a non-ISR replica, losing records above the HWM
    #[serde(default)]
    pub unclean_leader_election: bool,
    /// How often ISR membership is re-evaluated
    #[serde(default = "default_isr_check_interval_ms")]
    pub isr_check_interval_ms: u64,
}

fn default_replica_lag_time_max_ms() -> u64 {
    30_000
}

fn default_replica_fetch_wait_ms() -> u64 {
    500
}

fn default_replica_fetch_max_bytes() -> i32 {
    8 * 1024 * 1024
}

fn default_isr_check_interval_ms() -> u64 {
    2_500
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_lag_time_max_ms: default_replica_lag_time_max_ms(),
            replica_fetch_wait_ms: default_replica_fetch_wait_ms(),
            replica_fetch_max_bytes: default_replica_fetch_max_bytes(),
            unclean_leader_election: false,
            isr_check_interval_ms: default_isr_check_interval_ms(),
        }
    }
}

/// Consumer group coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_min_session_timeout_ms")]
    pub min_session_timeout_ms: i32,
    #[serde(default = "default_max_session_timeout_ms")]
    pub max_session_timeout_ms: i32,
    /// Extra wait for the first member of a new group before rebalancing
    #[serde(default = "default_initial_rebalance_delay_ms")]
    pub initial_rebalance_delay_ms: u64,
    /// Partitions of the internal offsets topic (fixed at first boot)
    #[serde(default = "default_offsets_topic_partitions")]
    pub offsets_topic_partitions: i32,
}

fn default_min_session_timeout_ms() -> i32 {
    6_000
}

fn default_max_session_timeout_ms() -> i32 {
    300_000
}

fn default_initial_rebalance_delay_ms() -> u64 {
    3_000
}

fn default_offsets_topic_partitions() -> i32 {
    crate::limits::DEFAULT_OFFSETS_TOPIC_PARTITIONS
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            min_session_timeout_ms: default_min_session_timeout_ms(),
            max_session_timeout_ms: default_max_session_timeout_ms(),
            initial_rebalance_delay_ms: default_initial_rebalance_delay_ms(),
            offsets_topic_partitions: default_offsets_topic_partitions(),
        }
    }
}

/// Transaction coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    #[serde(default = "default_txn_timeout_ms")]
    pub default_timeout_ms: i32,
    #[serde(default = "default_txn_max_timeout_ms")]
    pub max_timeout_ms: i32,
    /// Sweep interval for expired transactions
    #[serde(default = "default_txn_abort_check_interval_ms")]
    pub abort_check_interval_ms: u64,
    /// Producer ids are allocated from the control plane in blocks
    #[serde(default = "default_producer_id_block_size")]
    pub producer_id_block_size: i64,
}

fn default_txn_timeout_ms() -> i32 {
    60_000
}

fn default_txn_max_timeout_ms() -> i32 {
    900_000
}

fn default_txn_abort_check_interval_ms() -> u64 {
    10_000
}

fn default_producer_id_block_size() -> i64 {
    1_000
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_txn_timeout_ms(),
            max_timeout_ms: default_txn_max_timeout_ms(),
            abort_check_interval_ms: default_txn_abort_check_interval_ms(),
            producer_id_block_size: default_producer_id_block_size(),
        }
    }
}

/// Client-facing network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connections beyond this are refused
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle connections are closed after this long
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Largest accepted request frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_max_connections() -> usize {
    1024
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_max_frame_bytes() -> usize {
    crate::limits::MAX_FRAME_BYTES
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Control-plane consensus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    #[serde(default = "default_raft_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_raft_election_ms")]
    pub election_ms: u64,
    /// Proposals not applied within this window fail with REQUEST_TIMED_OUT
    #[serde(default = "default_raft_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    /// Snapshot once the log holds this many applied entries
    #[serde(default = "default_raft_snapshot_threshold")]
    pub snapshot_threshold: u64,
}

fn default_raft_heartbeat_ms() -> u64 {
    1_000
}

fn default_raft_election_ms() -> u64 {
    3_000
}

fn default_raft_commit_timeout_ms() -> u64 {
    10_000
}

fn default_raft_snapshot_threshold() -> u64 {
    16_384
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_raft_heartbeat_ms(),
            election_ms: default_raft_election_ms(),
            commit_timeout_ms: default_raft_commit_timeout_ms(),
            snapshot_threshold: default_raft_snapshot_threshold(),
        }
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_id")]
    pub broker_id: i32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Addresses to bind the Kafka listener on
    #[serde(deserialize_with = "deserialize_addrs", default = "default_listeners")]
    pub listeners: Vec<String>,
    /// Address clients are told to connect to (defaults to first listener)
    #[serde(default)]
    pub advertised_listeners: Option<String>,
    /// Consensus peers as `id@host:port` (empty = single node)
    #[serde(deserialize_with = "deserialize_addrs", default)]
    pub cluster_peers: Vec<String>,
    /// Initialize a fresh cluster on first start
    #[serde(default)]
    pub bootstrap: bool,

    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub raft: RaftConfig,
}

fn default_broker_id() -> i32 {
    0
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_listeners() -> Vec<String> {
    vec!["0.0.0.0:9092".to_string()]
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: default_broker_id(),
            data_dir: default_data_dir(),
            listeners: default_listeners(),
            advertised_listeners: None,
            cluster_peers: Vec::new(),
            bootstrap: false,
            storage: StorageConfig::default(),
            replication: ReplicationConfig::default(),
            group: GroupConfig::default(),
            transaction: TransactionConfig::default(),
            network: NetworkConfig::default(),
            raft: RaftConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// The address advertised in Metadata responses.
    pub fn advertised_addr(&self) -> crate::Result<(String, i32)> {
        let addr = match &self.advertised_listeners {
            Some(a) => a.clone(),
            None => self
                .listeners
                .first()
                .cloned()
                .ok_or_else(|| crate::BrokerError::InvalidConfig("no listeners".into()))?,
        };
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| crate::BrokerError::InvalidConfig(format!("bad address {addr}")))?;
        let port: i32 = port
            .parse()
            .map_err(|_| crate::BrokerError::InvalidConfig(format!("bad port in {addr}")))?;
        let host = if host == "0.0.0.0" { "localhost" } else { host };
        Ok((host.to_string(), port))
    }

    /// Parses `cluster_peers` entries of the form `id@host:port`.
    pub fn parse_peers(&self) -> crate::Result<Vec<(i32, String)>> {
        let mut peers = Vec::new();
        for entry in &self.cluster_peers {
            let (id, addr) = entry.split_once('@').ok_or_else(|| {
                crate::BrokerError::InvalidConfig(format!("peer {entry:?} is not id@host:port"))
            })?;
            let id: i32 = id.parse().map_err(|_| {
                crate::BrokerError::InvalidConfig(format!("peer id in {entry:?} is not an integer"))
            })?;
            peers.push((id, addr.to_string()));
        }
        Ok(peers)
    }

    /// Sanity checks that cannot be expressed in serde defaults.
    pub fn validate(&self) -> crate::Result<()> {
        if self.listeners.is_empty() {
            return Err(crate::BrokerError::InvalidConfig("no listeners".into()));
        }
        if self.broker_id < 0 {
            return Err(crate::BrokerError::InvalidConfig(
                "broker_id must be non-negative".into(),
            ));
        }
        if self.storage.index_interval_bytes == 0 {
            return Err(crate::BrokerError::InvalidConfig(
                "index_interval_bytes must be positive".into(),
            ));
        }
        self.parse_peers()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = BrokerConfig::default();
        config.validate().expect("default config is valid");
        assert_eq!(config.storage.segment_bytes, 128 * 1024 * 1024);
        assert_eq!(config.raft.heartbeat_ms, 1_000);
        assert_eq!(config.raft.election_ms, 3_000);
    }

    #[test]
    fn test_peer_parsing() {
        let mut config = BrokerConfig::default();
        config.cluster_peers = vec!["1@h1:9192".into(), "2@h2:9192".into()];
        let peers = config.parse_peers().unwrap();
        assert_eq!(peers, vec![(1, "h1:9192".into()), (2, "h2:9192".into())]);

        config.cluster_peers = vec!["h1:9192".into()];
        assert!(config.parse_peers().is_err());
    }

    #[test]
    fn test_topic_config_overrides() {
        let storage = StorageConfig::default();
        let mut tc = TopicConfig::from_storage(&storage);
        tc.set("cleanup.policy", "compact").unwrap();
        tc.set("retention.ms", "1000").unwrap();
        assert_eq!(tc.cleanup_policy, CleanupPolicy::Compact);
        assert_eq!(tc.retention_ms, 1000);
        assert!(tc.set("nope", "1").is_err());
        assert!(tc.set("retention.ms", "abc").is_err());
    }

    #[test]
    fn test_advertised_addr_falls_back_to_listener() {
        let config = BrokerConfig::default();
        let (host, port) = config.advertised_addr().unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 9092);
    }
}
