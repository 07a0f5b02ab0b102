//! Produce (key 0), versions 3-5. Version 3 introduced the transactional id
//! and requires record batch v2 payloads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

#[derive(Debug, Clone)]
pub struct ProducePartitionData {
    pub index: i32,
    /// Raw record batch bytes; the broker validates and stamps them.
    pub records: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicData {
    pub name: String,
    pub partitions: Vec<ProducePartitionData>,
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopicData>,
}

impl ProduceRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            transactional_id: buf.read_nullable_string("transactional_id")?,
            acks: buf.read_i16("acks")?,
            timeout_ms: buf.read_i32("timeout_ms")?,
            topics: buf.read_array("topic_data", |b| {
                Ok(ProduceTopicData {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partition_data", |b| {
                        Ok(ProducePartitionData {
                            index: b.read_i32("partition")?,
                            records: b.read_nullable_bytes("records")?,
                        })
                    })?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_nullable_string(self.transactional_id.as_deref());
        buf.put_i16(self.acks);
        buf.put_i32(self.timeout_ms);
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.index);
                b.put_nullable_bytes(p.records.as_deref());
            });
        });
    }
}

#[derive(Debug, Clone)]
pub struct ProducePartitionResponse {
    pub index: i32,
    pub error_code: i16,
    pub base_offset: i64,
    pub log_append_time_ms: i64,
    pub log_start_offset: i64,
}

impl ProducePartitionResponse {
    pub fn error(index: i32, error_code: i16) -> Self {
        Self {
            index,
            error_code,
            base_offset: -1,
            log_append_time_ms: -1,
            log_start_offset: -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

impl ProduceResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.index);
                b.put_i16(p.error_code);
                b.put_i64(p.base_offset);
                b.put_i64(p.log_append_time_ms);
                if version >= 5 {
                    b.put_i64(p.log_start_offset);
                }
            });
        });
        buf.put_i32(self.throttle_time_ms);
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let topics = buf.read_array("responses", |b| {
            Ok(ProduceTopicResponse {
                name: b.read_string("topic")?,
                partitions: b.read_array("partition_responses", |b| {
                    Ok(ProducePartitionResponse {
                        index: b.read_i32("partition")?,
                        error_code: b.read_i16("error_code")?,
                        base_offset: b.read_i64("base_offset")?,
                        log_append_time_ms: b.read_i64("log_append_time_ms")?,
                        log_start_offset: if version >= 5 {
                            b.read_i64("log_start_offset")?
                        } else {
                            -1
                        },
                    })
                })?,
            })
        })?;
        let throttle_time_ms = buf.read_i32("throttle_time_ms")?;
        Ok(Self {
            topics,
            throttle_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_round_trip() {
        let request = ProduceRequest {
            transactional_id: Some("tx-1".into()),
            acks: -1,
            timeout_ms: 30_000,
            topics: vec![ProduceTopicData {
                name: "orders".into(),
                partitions: vec![ProducePartitionData {
                    index: 0,
                    records: Some(Bytes::from_static(b"\x00\x01\x02")),
                }],
            }],
        };
        for version in 3..=5 {
            let mut buf = BytesMut::new();
            request.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = ProduceRequest::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.acks, -1);
            assert_eq!(decoded.transactional_id.as_deref(), Some("tx-1"));
        }

        let response = ProduceResponse {
            topics: vec![ProduceTopicResponse {
                name: "orders".into(),
                partitions: vec![ProducePartitionResponse {
                    index: 0,
                    error_code: 0,
                    base_offset: 10,
                    log_append_time_ms: -1,
                    log_start_offset: 0,
                }],
            }],
            throttle_time_ms: 0,
        };
        for version in 3..=5 {
            let mut buf = BytesMut::new();
            response.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = ProduceResponse::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.topics[0].partitions[0].base_offset, 10);
        }
    }
}
