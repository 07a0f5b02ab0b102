//! Cluster layer: a Raft-style consensus group for control-plane state
//! (topics, configs, ISR, producer ids, transaction state) and the
//! data-plane replication that rides on the ordinary Fetch API.
//!
//! The consensus group stays deliberately small: per-record replication is
//! driven by partition leaders, not by the consensus log.

pub mod client;
pub mod command;
pub mod error;
pub mod node;
pub mod raft_log;
pub mod replicator;
pub mod state;
pub mod transport;

pub use client::InternalClient;
pub use command::{ApplyData, Command, MetadataEvent, TxnStateKind};
pub use error::{ClusterError, Result};
pub use node::{Cluster, ClusterHandle};
pub use replicator::ReplicationManager;
pub use state::{BrokerInfo, MetadataState, PartitionMeta, TopicMeta, TxnMeta};
