//! Committed-offset storage.
//!
//! Offsets live in memory for serving and are persisted by appending
//! schema-versioned binary records to the internal `__consumer_offsets`
//! topic, so they replicate and recover like any other partition data.
//! Key version 1 carries (group, topic, partition); key version 2 marks a
//! group-metadata record. A null value is a tombstone removing the key.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use broker_core::TopicPartition;
use protocol::wire::{ReadExt, WriteExt};
use protocol::{Record, RecordBatch};

use crate::error::Result;

const SNAPSHOT_FILE: &str = "group-offsets.json";

const OFFSET_COMMIT_KEY_VERSION: i16 = 1;
const GROUP_METADATA_KEY_VERSION: i16 = 2;
const OFFSET_COMMIT_VALUE_VERSION: i16 = 1;
const GROUP_METADATA_VALUE_VERSION: i16 = 1;

/// Which `__consumer_offsets` partition hosts a group. The leader of that
/// partition is the group's coordinator.
pub fn offsets_partition_for(group_id: &str, partition_count: i32) -> i32 {
    let mut hasher = DefaultHasher::new();
    group_id.hash(&mut hasher);
    (hasher.finish() % partition_count as u64) as i32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetAndMetadata {
    pub offset: i64,
    pub metadata: Option<String>,
    pub commit_timestamp: i64,
}

/// One parsed record of the offsets topic.
#[derive(Debug, Clone, PartialEq)]
pub enum OffsetsTopicRecord {
    OffsetCommit {
        group: String,
        tp: TopicPartition,
        value: Option<OffsetAndMetadata>,
    },
    GroupMetadata {
        group: String,
        value: Option<GroupMetadataValue>,
    },
}

/// Durable group skeleton: enough to fence stale generations after a
/// coordinator move. Members re-join on their own.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMetadataValue {
    pub protocol_type: String,
    pub generation_id: i32,
    pub protocol_name: Option<String>,
    pub leader: Option<String>,
    pub members: Vec<GroupMetadataMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMetadataMember {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    pub subscription: Bytes,
    pub assignment: Bytes,
}

/// Encodes an offset-commit record.
pub fn encode_offset_commit(
    group: &str,
    tp: &TopicPartition,
    value: Option<&OffsetAndMetadata>,
) -> Record {
    let mut key = BytesMut::new();
    key.put_i16(OFFSET_COMMIT_KEY_VERSION);
    key.put_string(group);
    key.put_string(&tp.topic);
    key.put_i32(tp.partition);

    let value = value.map(|v| {
        let mut buf = BytesMut::new();
        buf.put_i16(OFFSET_COMMIT_VALUE_VERSION);
        buf.put_i64(v.offset);
        buf.put_nullable_string(v.metadata.as_deref());
        buf.put_i64(v.commit_timestamp);
        buf.freeze()
    });
    Record::new(Some(key.freeze()), value)
}

/// Encodes a group-metadata record.
pub fn encode_group_metadata(group: &str, value: Option<&GroupMetadataValue>) -> Record {
    let mut key = BytesMut::new();
    key.put_i16(GROUP_METADATA_KEY_VERSION);
    key.put_string(group);

    let value = value.map(|v| {
        let mut buf = BytesMut::new();
        buf.put_i16(GROUP_METADATA_VALUE_VERSION);
        buf.put_string(&v.protocol_type);
        buf.put_i32(v.generation_id);
        buf.put_nullable_string(v.protocol_name.as_deref());
        buf.put_nullable_string(v.leader.as_deref());
        buf.put_array(&v.members, |b, m| {
            b.put_string(&m.member_id);
            b.put_string(&m.client_id);
            b.put_string(&m.client_host);
            b.put_i32(m.session_timeout_ms);
            b.put_i32(m.rebalance_timeout_ms);
            b.put_bytes_block(&m.subscription);
            b.put_bytes_block(&m.assignment);
        });
        buf.freeze()
    });
    Record::new(Some(key.freeze()), value)
}

/// Parses one offsets-topic record by its key version.
pub fn decode_offsets_record(record: &Record) -> Result<Option<OffsetsTopicRecord>> {
    let Some(key) = &record.key else {
        return Ok(None);
    };
    let mut key = key.clone();
    let version = key.read_i16("offsets_key_version")?;
    match version {
        OFFSET_COMMIT_KEY_VERSION => {
            let group = key.read_string("group")?;
            let topic = key.read_string("topic")?;
            let partition = key.read_i32("partition")?;
            let value = match &record.value {
                None => None,
                Some(raw) => {
                    let mut raw = raw.clone();
                    let _version = raw.read_i16("offset_value_version")?;
                    Some(OffsetAndMetadata {
                        offset: raw.read_i64("offset")?,
                        metadata: raw.read_nullable_string("metadata")?,
                        commit_timestamp: raw.read_i64("commit_timestamp")?,
                    })
                }
            };
            Ok(Some(OffsetsTopicRecord::OffsetCommit {
                group,
                tp: TopicPartition::new(topic, partition),
                value,
            }))
        }
        GROUP_METADATA_KEY_VERSION => {
            let group = key.read_string("group")?;
            let value = match &record.value {
                None => None,
                Some(raw) => {
                    let mut raw = raw.clone();
                    let _version = raw.read_i16("group_value_version")?;
                    Some(GroupMetadataValue {
                        protocol_type: raw.read_string("protocol_type")?,
                        generation_id: raw.read_i32("generation_id")?,
                        protocol_name: raw.read_nullable_string("protocol_name")?,
                        leader: raw.read_nullable_string("leader")?,
                        members: raw.read_array("members", |b| {
                            Ok(GroupMetadataMember {
                                member_id: b.read_string("member_id")?,
                                client_id: b.read_string("client_id")?,
                                client_host: b.read_string("client_host")?,
                                session_timeout_ms: b.read_i32("session_timeout_ms")?,
                                rebalance_timeout_ms: b.read_i32("rebalance_timeout_ms")?,
                                subscription: b.read_bytes("subscription")?,
                                assignment: b.read_bytes("assignment")?,
                            })
                        })?,
                    })
                }
            };
            Ok(Some(OffsetsTopicRecord::GroupMetadata { group, value }))
        }
        _ => Ok(None),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OffsetsSnapshot {
    groups: Vec<(String, Vec<(TopicPartition, OffsetAndMetadata)>)>,
}

/// In-memory committed offsets, with replay from the offsets topic.
#[derive(Default)]
pub struct OffsetStore {
    committed: RwLock<HashMap<String, HashMap<TopicPartition, OffsetAndMetadata>>>,
    /// Group skeletons recovered from the log, keyed by group.
    recovered_groups: RwLock<HashMap<String, GroupMetadataValue>>,
}

impl OffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&self, group: &str, tp: TopicPartition, value: OffsetAndMetadata) {
        self.committed
            .write()
            .entry(group.to_string())
            .or_default()
            .insert(tp, value);
        telemetry::metrics().offsets_committed.inc();
    }

    pub fn fetch(&self, group: &str, tp: &TopicPartition) -> Option<OffsetAndMetadata> {
        self.committed.read().get(group)?.get(tp).cloned()
    }

    pub fn fetch_all(&self, group: &str) -> Vec<(TopicPartition, OffsetAndMetadata)> {
        self.committed
            .read()
            .get(group)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn remove_group(&self, group: &str) {
        self.committed.write().remove(group);
        self.recovered_groups.write().remove(group);
    }

    pub fn recovered_group(&self, group: &str) -> Option<GroupMetadataValue> {
        self.recovered_groups.read().get(group).cloned()
    }

    /// Writes the committed-offset snapshot under `<data-dir>/coordinator/`.
    /// The offsets topic remains the authority; this only speeds up cold
    /// starts.
    pub async fn persist_to(&self, coordinator_dir: &std::path::Path) -> std::io::Result<()> {
        let snapshot = OffsetsSnapshot {
            groups: self
                .committed
                .read()
                .iter()
                .map(|(group, offsets)| {
                    (
                        group.clone(),
                        offsets.iter().map(|(tp, v)| (tp.clone(), v.clone())).collect(),
                    )
                })
                .collect(),
        };
        tokio::fs::create_dir_all(coordinator_dir).await?;
        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(coordinator_dir.join(SNAPSHOT_FILE), json).await
    }

    /// Seeds the store from the snapshot, if one exists. Replaying the
    /// offsets topic afterwards overrides anything stale.
    pub async fn load_from(&self, coordinator_dir: &std::path::Path) {
        let Ok(bytes) = tokio::fs::read(coordinator_dir.join(SNAPSHOT_FILE)).await else {
            return;
        };
        let Ok(snapshot) = serde_json::from_slice::<OffsetsSnapshot>(&bytes) else {
            return;
        };
        let mut committed = self.committed.write();
        for (group, offsets) in snapshot.groups {
            committed
                .entry(group)
                .or_default()
                .extend(offsets.into_iter());
        }
    }

    /// Replays raw offsets-partition batches (cold start).
    pub fn replay(&self, mut batches: Bytes) -> Result<usize> {
        let mut replayed = 0;
        while let Some((header, raw)) = protocol::records::split_next_batch(&mut batches)? {
            if header.is_control() || header.compression_codec() != 0 {
                continue;
            }
            let batch = RecordBatch::decode(&mut raw.clone())?;
            for record in &batch.records {
                match decode_offsets_record(record)? {
                    Some(OffsetsTopicRecord::OffsetCommit { group, tp, value }) => {
                        match value {
                            Some(value) => {
                                self.committed
                                    .write()
                                    .entry(group)
                                    .or_default()
                                    .insert(tp, value);
                            }
                            None => {
                                if let Some(map) = self.committed.write().get_mut(&group) {
                                    map.remove(&tp);
                                }
                            }
                        }
                        replayed += 1;
                    }
                    Some(OffsetsTopicRecord::GroupMetadata { group, value }) => {
                        match value {
                            Some(value) => {
                                self.recovered_groups.write().insert(group, value);
                            }
                            None => {
                                self.recovered_groups.write().remove(&group);
                            }
                        }
                        replayed += 1;
                    }
                    None => {}
                }
            }
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_hash_is_stable() {
        let a = offsets_partition_for("g1", 50);
        let b = offsets_partition_for("g1", 50);
        assert_eq!(a, b);
        assert!((0..50).contains(&a));
    }

    #[test]
    fn test_offset_commit_record_round_trip() {
        let tp = TopicPartition::new("orders", 3);
        let value = OffsetAndMetadata {
            offset: 42,
            metadata: Some("checkpoint".into()),
            commit_timestamp: 1_700_000_000_000,
        };
        let record = encode_offset_commit("g1", &tp, Some(&value));
        match decode_offsets_record(&record).unwrap().unwrap() {
            OffsetsTopicRecord::OffsetCommit {
                group,
                tp: parsed_tp,
                value: parsed,
            } => {
                assert_eq!(group, "g1");
                assert_eq!(parsed_tp, tp);
                assert_eq!(parsed.unwrap(), value);
            }
            other => panic!("unexpected record {other:?}"),
        }

        // Tombstone round trip.
        let record = encode_offset_commit("g1", &tp, None);
        match decode_offsets_record(&record).unwrap().unwrap() {
            OffsetsTopicRecord::OffsetCommit { value, .. } => assert!(value.is_none()),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_group_metadata_record_round_trip() {
        let value = GroupMetadataValue {
            protocol_type: "consumer".into(),
            generation_id: 7,
            protocol_name: Some("range".into()),
            leader: Some("m1".into()),
            members: vec![GroupMetadataMember {
                member_id: "m1".into(),
                client_id: "c1".into(),
                client_host: "10.0.0.1".into(),
                session_timeout_ms: 10_000,
                rebalance_timeout_ms: 30_000,
                subscription: Bytes::from_static(b"sub"),
                assignment: Bytes::from_static(b"assign"),
            }],
        };
        let record = encode_group_metadata("g1", Some(&value));
        match decode_offsets_record(&record).unwrap().unwrap() {
            OffsetsTopicRecord::GroupMetadata { group, value: parsed } => {
                assert_eq!(group, "g1");
                assert_eq!(parsed.unwrap(), value);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_replay_applies_latest_and_tombstones() {
        let store = OffsetStore::new();
        let tp = TopicPartition::new("orders", 0);
        let records = vec![
            encode_offset_commit(
                "g1",
                &tp,
                Some(&OffsetAndMetadata {
                    offset: 1,
                    metadata: None,
                    commit_timestamp: 1,
                }),
            ),
            encode_offset_commit(
                "g1",
                &tp,
                Some(&OffsetAndMetadata {
                    offset: 5,
                    metadata: None,
                    commit_timestamp: 2,
                }),
            ),
            encode_offset_commit("g2", &tp, None),
        ];
        let batch = RecordBatch::build(0, -1, -1, -1, records).encode();
        store.replay(batch).unwrap();
        assert_eq!(store.fetch("g1", &tp).unwrap().offset, 5);
        assert!(store.fetch("g2", &tp).is_none());
    }
}
