//! Fetch (key 1), versions 4-6. Consumers and follower replicas share this
//! API; a non-negative `replica_id` marks a replica fetch.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

/// `replica_id` for an ordinary consumer.
pub const CONSUMER_REPLICA_ID: i32 = -1;

#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub partition: i32,
    pub fetch_offset: i64,
    /// Follower's log start offset (v5+), -1 from consumers.
    pub log_start_offset: i64,
    pub partition_max_bytes: i32,
}

#[derive(Debug, Clone)]
pub struct FetchTopic {
    pub name: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: i8,
    pub topics: Vec<FetchTopic>,
}

impl FetchRequest {
    pub fn is_from_follower(&self) -> bool {
        self.replica_id >= 0
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        Ok(Self {
            replica_id: buf.read_i32("replica_id")?,
            max_wait_ms: buf.read_i32("max_wait_ms")?,
            min_bytes: buf.read_i32("min_bytes")?,
            max_bytes: buf.read_i32("max_bytes")?,
            isolation_level: buf.read_i8("isolation_level")?,
            topics: buf.read_array("topics", |b| {
                Ok(FetchTopic {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(FetchPartition {
                            partition: b.read_i32("partition")?,
                            fetch_offset: b.read_i64("fetch_offset")?,
                            log_start_offset: if version >= 5 {
                                b.read_i64("log_start_offset")?
                            } else {
                                -1
                            },
                            partition_max_bytes: b.read_i32("partition_max_bytes")?,
                        })
                    })?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_i32(self.replica_id);
        buf.put_i32(self.max_wait_ms);
        buf.put_i32(self.min_bytes);
        buf.put_i32(self.max_bytes);
        buf.put_i8(self.isolation_level);
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i64(p.fetch_offset);
                if version >= 5 {
                    b.put_i64(p.log_start_offset);
                }
                b.put_i32(p.partition_max_bytes);
            });
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

#[derive(Debug, Clone)]
pub struct FetchPartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
    pub aborted_transactions: Option<Vec<AbortedTransaction>>,
    pub records: Option<Bytes>,
}

impl FetchPartitionResponse {
    pub fn error(partition: i32, error_code: i16) -> Self {
        Self {
            partition,
            error_code,
            high_watermark: -1,
            last_stable_offset: -1,
            log_start_offset: -1,
            aborted_transactions: None,
            records: None,
        }
    }

    pub fn records_len(&self) -> usize {
        self.records.as_ref().map_or(0, |r| r.len())
    }
}

#[derive(Debug, Clone)]
pub struct FetchTopicResponse {
    pub name: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<FetchTopicResponse>,
}

impl FetchResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i16(p.error_code);
                b.put_i64(p.high_watermark);
                b.put_i64(p.last_stable_offset);
                if version >= 5 {
                    b.put_i64(p.log_start_offset);
                }
                match &p.aborted_transactions {
                    Some(aborted) => b.put_array(aborted, |b, a| {
                        b.put_i64(a.producer_id);
                        b.put_i64(a.first_offset);
                    }),
                    None => b.put_null_array(),
                }
                b.put_nullable_bytes(p.records.as_deref());
            });
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = buf.read_i32("throttle_time_ms")?;
        let topics = buf.read_array("responses", |b| {
            Ok(FetchTopicResponse {
                name: b.read_string("topic")?,
                partitions: b.read_array("partitions", |b| {
                    Ok(FetchPartitionResponse {
                        partition: b.read_i32("partition")?,
                        error_code: b.read_i16("error_code")?,
                        high_watermark: b.read_i64("high_watermark")?,
                        last_stable_offset: b.read_i64("last_stable_offset")?,
                        log_start_offset: if version >= 5 {
                            b.read_i64("log_start_offset")?
                        } else {
                            -1
                        },
                        aborted_transactions: b.read_nullable_array("aborted_transactions", |b| {
                            Ok(AbortedTransaction {
                                producer_id: b.read_i64("producer_id")?,
                                first_offset: b.read_i64("first_offset")?,
                            })
                        })?,
                        records: b.read_nullable_bytes("records")?,
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
    fn test_fetch_round_trip() {
        let request = FetchRequest {
            replica_id: CONSUMER_REPLICA_ID,
            max_wait_ms: 500,
            min_bytes: 1,
            max_bytes: 1 << 20,
            isolation_level: 1,
            topics: vec![FetchTopic {
                name: "orders".into(),
                partitions: vec![FetchPartition {
                    partition: 0,
                    fetch_offset: 42,
                    log_start_offset: -1,
                    partition_max_bytes: 1 << 20,
                }],
            }],
        };
        for version in 4..=6 {
            let mut buf = BytesMut::new();
            request.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = FetchRequest::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.topics[0].partitions[0].fetch_offset, 42);
            assert!(!decoded.is_from_follower());
        }

        let response = FetchResponse {
            throttle_time_ms: 0,
            topics: vec![FetchTopicResponse {
                name: "orders".into(),
                partitions: vec![FetchPartitionResponse {
                    partition: 0,
                    error_code: 0,
                    high_watermark: 100,
                    last_stable_offset: 100,
                    log_start_offset: 0,
                    aborted_transactions: Some(vec![AbortedTransaction {
                        producer_id: 7,
                        first_offset: 90,
                    }]),
                    records: Some(Bytes::from_static(b"batchbytes")),
                }],
            }],
        };
        for version in 4..=6 {
            let mut buf = BytesMut::new();
            response.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = FetchResponse::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            let p = &decoded.topics[0].partitions[0];
            assert_eq!(p.high_watermark, 100);
            assert_eq!(
                p.aborted_transactions.as_ref().unwrap()[0].producer_id,
                7
            );
        }
    }
}
