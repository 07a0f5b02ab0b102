//! ListOffsets (key 2), versions 1-2.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

/// Special timestamp: the latest offset (HWM for consumers, LEO for replicas).
pub const LATEST_TIMESTAMP: i64 = -1;
/// Special timestamp: the log start offset.
pub const EARLIEST_TIMESTAMP: i64 = -2;

#[derive(Debug, Clone)]
pub struct ListOffsetsPartition {
    pub partition: i32,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsTopic {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsRequest {
    pub replica_id: i32,
    pub isolation_level: i8,
    pub topics: Vec<ListOffsetsTopic>,
}

impl ListOffsetsRequest {
    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        Ok(Self {
            replica_id: buf.read_i32("replica_id")?,
            isolation_level: if version >= 2 {
                buf.read_i8("isolation_level")?
            } else {
                0
            },
            topics: buf.read_array("topics", |b| {
                Ok(ListOffsetsTopic {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(ListOffsetsPartition {
                            partition: b.read_i32("partition")?,
                            timestamp: b.read_i64("timestamp")?,
                        })
                    })?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_i32(self.replica_id);
        if version >= 2 {
            buf.put_i8(self.isolation_level);
        }
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i64(p.timestamp);
            });
        });
    }
}

#[derive(Debug, Clone)]
pub struct ListOffsetsPartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    pub timestamp: i64,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsTopicResponse {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<ListOffsetsTopicResponse>,
}

impl ListOffsetsResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 2 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i16(p.error_code);
                b.put_i64(p.timestamp);
                b.put_i64(p.offset);
            });
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 2 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        let topics = buf.read_array("topics", |b| {
            Ok(ListOffsetsTopicResponse {
                name: b.read_string("topic")?,
                partitions: b.read_array("partitions", |b| {
                    Ok(ListOffsetsPartitionResponse {
                        partition: b.read_i32("partition")?,
                        error_code: b.read_i16("error_code")?,
                        timestamp: b.read_i64("timestamp")?,
                        offset: b.read_i64("offset")?,
                    })
                })?,
            })
        })?;
        Ok(Self {
            throttle_time_ms,
            topics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_offsets_round_trip() {
        let request = ListOffsetsRequest {
            replica_id: -1,
            isolation_level: 0,
            topics: vec![ListOffsetsTopic {
                name: "orders".into(),
                partitions: vec![ListOffsetsPartition {
                    partition: 0,
                    timestamp: EARLIEST_TIMESTAMP,
                }],
            }],
        };
        for version in 1..=2 {
            let mut buf = BytesMut::new();
            request.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = ListOffsetsRequest::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.topics[0].partitions[0].timestamp, EARLIEST_TIMESTAMP);
        }
    }
}
