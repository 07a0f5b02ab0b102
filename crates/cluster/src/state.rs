//! The control-plane state machine.
//!
//! Applies replicated [`Command`]s to an in-memory map of brokers, topics,
//! partition leadership, the producer-id allocator, and transaction state.
//! Application is deterministic; side effects on local storage (creating
//! or deleting hosted partitions) are driven by the events it returns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use broker_core::{TopicConfig, TopicPartition};

use crate::command::{ApplyData, Command, MetadataEvent, TxnStateKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub leader: i32,
    pub leader_epoch: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMeta {
    pub name: String,
    pub partition_count: i32,
    pub replication_factor: i16,
    pub config: TopicConfig,
    pub partitions: Vec<PartitionMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnMeta {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub state: TxnStateKind,
    pub partitions: Vec<TopicPartition>,
    pub coordinator_epoch: i32,
    pub deadline_ms: i64,
}

/// Outcome of applying one command.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub result: Result<ApplyData, String>,
    pub events: Vec<MetadataEvent>,
}

impl ApplyOutcome {
    fn ok(events: Vec<MetadataEvent>) -> Self {
        Self {
            result: Ok(ApplyData::None),
            events,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataState {
    pub brokers: BTreeMap<i32, BrokerInfo>,
    pub topics: BTreeMap<String, TopicMeta>,
    pub next_producer_id: i64,
    pub txns: BTreeMap<String, TxnMeta>,
}

impl MetadataState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker_addr(&self, broker_id: i32) -> Option<&BrokerInfo> {
        self.brokers.get(&broker_id)
    }

    pub fn topic(&self, name: &str) -> Option<&TopicMeta> {
        self.topics.get(name)
    }

    pub fn partition(&self, tp: &TopicPartition) -> Option<&PartitionMeta> {
        self.topics
            .get(&tp.topic)
            .and_then(|t| t.partitions.get(tp.partition as usize))
    }

    pub fn leader_of(&self, tp: &TopicPartition) -> Option<i32> {
        self.partition(tp).map(|p| p.leader)
    }

    pub fn txn(&self, transactional_id: &str) -> Option<&TxnMeta> {
        self.txns.get(transactional_id)
    }

    /// Applies one command, returning the proposer-visible result and the
    /// events for local subsystems.
    pub fn apply(&mut self, command: &Command) -> ApplyOutcome {
        match command {
            Command::Noop => ApplyOutcome::ok(Vec::new()),

            Command::RegisterBroker {
                broker_id,
                host,
                port,
            } => {
                self.brokers.insert(
                    *broker_id,
                    BrokerInfo {
                        host: host.clone(),
                        port: *port,
                    },
                );
                ApplyOutcome::ok(Vec::new())
            }

            Command::CreateTopic {
                name,
                partition_count,
                replication_factor,
                config,
                assignments,
            } => {
                if self.topics.contains_key(name) {
                    return ApplyOutcome::err(format!("topic {name} already exists"));
                }
                if *partition_count < 1 || assignments.len() != *partition_count as usize {
                    return ApplyOutcome::err("invalid partition assignment");
                }
                let partitions: Vec<PartitionMeta> = assignments
                    .iter()
                    .map(|replicas| PartitionMeta {
                        leader: replicas.first().copied().unwrap_or(-1),
                        leader_epoch: 0,
                        replicas: replicas.clone(),
                        isr: replicas.clone(),
                    })
                    .collect();
                let mut events = vec![MetadataEvent::TopicCreated { name: name.clone() }];
                for (i, p) in partitions.iter().enumerate() {
                    events.push(MetadataEvent::LeadershipChanged {
                        tp: TopicPartition::new(name.clone(), i as i32),
                        leader: p.leader,
                        leader_epoch: p.leader_epoch,
                        replicas: p.replicas.clone(),
                        isr: p.isr.clone(),
                    });
                }
                self.topics.insert(
                    name.clone(),
                    TopicMeta {
                        name: name.clone(),
                        partition_count: *partition_count,
                        replication_factor: *replication_factor,
                        config: config.clone(),
                        partitions,
                    },
                );
                ApplyOutcome::ok(events)
            }

            Command::DeleteTopic { name } => {
                if self.topics.remove(name).is_none() {
                    return ApplyOutcome::err(format!("unknown topic {name}"));
                }
                ApplyOutcome::ok(vec![MetadataEvent::TopicDeleted { name: name.clone() }])
            }

            Command::AlterTopicConfig { name, overrides } => {
                let Some(topic) = self.topics.get_mut(name) else {
                    return ApplyOutcome::err(format!("unknown topic {name}"));
                };
                let mut config = topic.config.clone();
                for (key, value) in overrides {
                    let Some(value) = value.as_deref() else {
                        return ApplyOutcome::err(format!("null value for {key}"));
                    };
                    if let Err(err) = config.set(key, value) {
                        return ApplyOutcome::err(err.to_string());
                    }
                }
                topic.config = config;
                ApplyOutcome::ok(Vec::new())
            }

            Command::AllocateProducerIds { count } => {
                let first = self.next_producer_id;
                self.next_producer_id += count;
                ApplyOutcome {
                    result: Ok(ApplyData::ProducerIds {
                        first,
                        count: *count,
                    }),
                    events: Vec::new(),
                }
            }

            Command::UpdateIsr {
                topic,
                partition,
                leader,
                leader_epoch,
                isr,
            } => {
                let Some(meta) = self.topics.get_mut(topic) else {
                    return ApplyOutcome::err(format!("unknown topic {topic}"));
                };
                let Some(p) = meta.partitions.get_mut(*partition as usize) else {
                    return ApplyOutcome::err(format!("unknown partition {topic}-{partition}"));
                };
                if *leader_epoch < p.leader_epoch {
                    return ApplyOutcome::err(format!(
                        "stale leader epoch {leader_epoch} < {}",
                        p.leader_epoch
                    ));
                }
                p.leader = *leader;
                p.leader_epoch = *leader_epoch;
                p.isr = isr.clone();
                ApplyOutcome::ok(vec![MetadataEvent::LeadershipChanged {
                    tp: TopicPartition::new(topic.clone(), *partition),
                    leader: *leader,
                    leader_epoch: *leader_epoch,
                    replicas: p.replicas.clone(),
                    isr: isr.clone(),
                }])
            }

            Command::UpdateTxn {
                transactional_id,
                producer_id,
                producer_epoch,
                state,
                partitions,
                coordinator_epoch,
                deadline_ms,
            } => {
                self.txns.insert(
                    transactional_id.clone(),
                    TxnMeta {
                        producer_id: *producer_id,
                        producer_epoch: *producer_epoch,
                        state: *state,
                        partitions: partitions.clone(),
                        coordinator_epoch: *coordinator_epoch,
                        deadline_ms: *deadline_ms,
                    },
                );
                ApplyOutcome::ok(Vec::new())
            }

            Command::RemoveTxn { transactional_id } => {
                self.txns.remove(transactional_id);
                ApplyOutcome::ok(Vec::new())
            }
        }
    }

    /// Events that would recreate the current leadership layout; used when
    /// rehydrating local subsystems from a snapshot.
    pub fn leadership_events(&self) -> Vec<MetadataEvent> {
        let mut events = Vec::new();
        for topic in self.topics.values() {
            for (i, p) in topic.partitions.iter().enumerate() {
                events.push(MetadataEvent::LeadershipChanged {
                    tp: TopicPartition::new(topic.name.clone(), i as i32),
                    leader: p.leader,
                    leader_epoch: p.leader_epoch,
                    replicas: p.replicas.clone(),
                    isr: p.isr.clone(),
                });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::StorageConfig;

    fn create_topic_cmd(name: &str, partitions: i32, replicas: Vec<Vec<i32>>) -> Command {
        Command::CreateTopic {
            name: name.into(),
            partition_count: partitions,
            replication_factor: replicas.first().map(|r| r.len() as i16).unwrap_or(1),
            config: TopicConfig::from_storage(&StorageConfig::default()),
            assignments: replicas,
        }
    }

    #[test]
    fn test_create_topic_assigns_leadership() {
        let mut state = MetadataState::new();
        let outcome = state.apply(&create_topic_cmd("t", 2, vec![vec![1, 2], vec![2, 1]]));
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.events.len(), 3);

        let tp = TopicPartition::new("t", 0);
        assert_eq!(state.leader_of(&tp), Some(1));
        assert_eq!(state.partition(&tp).unwrap().isr, vec![1, 2]);

        // Duplicate create is rejected deterministically.
        let outcome = state.apply(&create_topic_cmd("t", 2, vec![vec![1], vec![1]]));
        assert!(outcome.result.is_err());
    }

    #[test]
    fn test_producer_id_allocation_is_monotone() {
        let mut state = MetadataState::new();
        let a = state.apply(&Command::AllocateProducerIds { count: 1000 });
        let b = state.apply(&Command::AllocateProducerIds { count: 1000 });
        assert_eq!(a.result.unwrap(), ApplyData::ProducerIds { first: 0, count: 1000 });
        assert_eq!(
            b.result.unwrap(),
            ApplyData::ProducerIds {
                first: 1000,
                count: 1000
            }
        );
    }

    #[test]
    fn test_stale_leader_epoch_rejected() {
        let mut state = MetadataState::new();
        state.apply(&create_topic_cmd("t", 1, vec![vec![1, 2, 3]]));
        let ok = state.apply(&Command::UpdateIsr {
            topic: "t".into(),
            partition: 0,
            leader: 2,
            leader_epoch: 1,
            isr: vec![2, 3],
        });
        assert!(ok.result.is_ok());
        let stale = state.apply(&Command::UpdateIsr {
            topic: "t".into(),
            partition: 0,
            leader: 1,
            leader_epoch: 0,
            isr: vec![1],
        });
        assert!(stale.result.is_err());
        assert_eq!(state.leader_of(&TopicPartition::new("t", 0)), Some(2));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut state = MetadataState::new();
        state.apply(&create_topic_cmd("t", 1, vec![vec![1]]));
        state.apply(&Command::AllocateProducerIds { count: 10 });
        let json = serde_json::to_vec(&state).unwrap();
        let restored: MetadataState = serde_json::from_slice(&json).unwrap();
        assert_eq!(restored.next_producer_id, 10);
        assert!(restored.topic("t").is_some());
    }
}
