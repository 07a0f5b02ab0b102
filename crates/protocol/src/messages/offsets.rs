//! OffsetCommit (key 8, versions 2-3) and OffsetFetch (key 9, versions 1-3).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

#[derive(Debug, Clone)]
pub struct OffsetCommitPartition {
    pub partition: i32,
    pub committed_offset: i64,
    pub committed_metadata: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitTopic {
    pub name: String,
    pub partitions: Vec<OffsetCommitPartition>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub retention_time_ms: i64,
    pub topics: Vec<OffsetCommitTopic>,
}

impl OffsetCommitRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            group_id: buf.read_string("group_id")?,
            generation_id: buf.read_i32("generation_id")?,
            member_id: buf.read_string("member_id")?,
            retention_time_ms: buf.read_i64("retention_time_ms")?,
            topics: buf.read_array("topics", |b| {
                Ok(OffsetCommitTopic {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(OffsetCommitPartition {
                            partition: b.read_i32("partition")?,
                            committed_offset: b.read_i64("committed_offset")?,
                            committed_metadata: b.read_nullable_string("committed_metadata")?,
                        })
                    })?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_string(&self.group_id);
        buf.put_i32(self.generation_id);
        buf.put_string(&self.member_id);
        buf.put_i64(self.retention_time_ms);
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i64(p.committed_offset);
                b.put_nullable_string(p.committed_metadata.as_deref());
            });
        });
    }
}

#[derive(Debug, Clone)]
pub struct OffsetCommitPartitionResponse {
    pub partition: i32,
    pub error_code: i16,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitTopicResponse {
    pub name: String,
    pub partitions: Vec<OffsetCommitPartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<OffsetCommitTopicResponse>,
}

impl OffsetCommitResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 3 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i16(p.error_code);
            });
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 3 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            topics: buf.read_array("topics", |b| {
                Ok(OffsetCommitTopicResponse {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(OffsetCommitPartitionResponse {
                            partition: b.read_i32("partition")?,
                            error_code: b.read_i16("error_code")?,
                        })
                    })?,
                })
            })?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OffsetFetchTopic {
    pub name: String,
    pub partition_indexes: Vec<i32>,
}

/// `topics: None` (v2+) fetches all offsets the group has committed.
#[derive(Debug, Clone)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub topics: Option<Vec<OffsetFetchTopic>>,
}

impl OffsetFetchRequest {
    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let group_id = buf.read_string("group_id")?;
        let read_topic = |b: &mut Bytes| {
            Ok(OffsetFetchTopic {
                name: b.read_string("topic")?,
                partition_indexes: b.read_array("partitions", |b| b.read_i32("partition"))?,
            })
        };
        let topics = if version >= 2 {
            buf.read_nullable_array("topics", read_topic)?
        } else {
            Some(buf.read_array("topics", read_topic)?)
        };
        Ok(Self { group_id, topics })
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_string(&self.group_id);
        match (&self.topics, version) {
            (None, v) if v >= 2 => buf.put_null_array(),
            (None, _) => buf.put_array::<OffsetFetchTopic, _>(&[], |_, _| {}),
            (Some(topics), _) => buf.put_array(topics, |b, topic| {
                b.put_string(&topic.name);
                b.put_array(&topic.partition_indexes, |b, p| b.put_i32(*p));
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OffsetFetchPartitionResponse {
    pub partition: i32,
    pub committed_offset: i64,
    pub metadata: Option<String>,
    pub error_code: i16,
}

#[derive(Debug, Clone)]
pub struct OffsetFetchTopicResponse {
    pub name: String,
    pub partitions: Vec<OffsetFetchPartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct OffsetFetchResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<OffsetFetchTopicResponse>,
    pub error_code: i16,
}

impl OffsetFetchResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 3 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i64(p.committed_offset);
                b.put_nullable_string(p.metadata.as_deref());
                b.put_i16(p.error_code);
            });
        });
        if version >= 2 {
            buf.put_i16(self.error_code);
        }
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 3 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        let topics = buf.read_array("topics", |b| {
            Ok(OffsetFetchTopicResponse {
                name: b.read_string("topic")?,
                partitions: b.read_array("partitions", |b| {
                    Ok(OffsetFetchPartitionResponse {
                        partition: b.read_i32("partition")?,
                        committed_offset: b.read_i64("committed_offset")?,
                        metadata: b.read_nullable_string("metadata")?,
                        error_code: b.read_i16("error_code")?,
                    })
                })?,
            })
        })?;
        let error_code = if version >= 2 {
            buf.read_i16("error_code")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            topics,
            error_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_commit_round_trip() {
        let request = OffsetCommitRequest {
            group_id: "g1".into(),
            generation_id: 5,
            member_id: "m1".into(),
            retention_time_ms: -1,
            topics: vec![OffsetCommitTopic {
                name: "orders".into(),
                partitions: vec![OffsetCommitPartition {
                    partition: 0,
                    committed_offset: 42,
                    committed_metadata: None,
                }],
            }],
        };
        for version in 2..=3 {
            let mut buf = BytesMut::new();
            request.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = OffsetCommitRequest::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.topics[0].partitions[0].committed_offset, 42);
        }
    }

    #[test]
    fn test_offset_fetch_all_topics() {
        let request = OffsetFetchRequest {
            group_id: "g1".into(),
            topics: None,
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf, 2);
        let mut b = buf.freeze();
        let decoded = OffsetFetchRequest::decode(&mut b, 2).unwrap();
        assert!(decoded.topics.is_none());
    }
}
