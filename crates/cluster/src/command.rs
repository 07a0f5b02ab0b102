//! Replicated control-plane commands and the events their application
//! raises.

use serde::{Deserialize, Serialize};

use broker_core::{TopicConfig, TopicPartition};

/// Transaction states tracked in the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStateKind {
    Empty,
    Ongoing,
    PrepareCommit,
    PrepareAbort,
    CompleteCommit,
    CompleteAbort,
}

impl TxnStateKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CompleteCommit | Self::CompleteAbort | Self::Empty)
    }
}

/// A command appended to the consensus log. Application must be
/// deterministic: every validation that can fail is re-checked inside
/// `apply` so all replicas agree on the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Leader no-op to commit the current term.
    Noop,
    RegisterBroker {
        broker_id: i32,
        host: String,
        port: i32,
    },
    CreateTopic {
        name: String,
        partition_count: i32,
        replication_factor: i16,
        config: TopicConfig,
        /// Replica assignment per partition; first replica leads.
        assignments: Vec<Vec<i32>>,
    },
    DeleteTopic {
        name: String,
    },
    AlterTopicConfig {
        name: String,
        overrides: Vec<(String, Option<String>)>,
    },
    AllocateProducerIds {
        count: i64,
    },
    /// Records a leadership / ISR change decided by the controller or an
    /// ISR shrink/expand observed by a partition leader.
    UpdateIsr {
        topic: String,
        partition: i32,
        leader: i32,
        leader_epoch: i32,
        isr: Vec<i32>,
    },
    UpdateTxn {
        transactional_id: String,
        producer_id: i64,
        producer_epoch: i16,
        state: TxnStateKind,
        partitions: Vec<TopicPartition>,
        coordinator_epoch: i32,
        deadline_ms: i64,
    },
    RemoveTxn {
        transactional_id: String,
    },
}

/// Data returned to the proposer once a command applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyData {
    None,
    ProducerIds { first: i64, count: i64 },
}

/// Events emitted by command application, consumed by the replication
/// manager and request handlers.
#[derive(Debug, Clone)]
pub enum MetadataEvent {
    TopicCreated {
        name: String,
    },
    TopicDeleted {
        name: String,
    },
    LeadershipChanged {
        tp: TopicPartition,
        leader: i32,
        leader_epoch: i32,
        replicas: Vec<i32>,
        isr: Vec<i32>,
    },
}
