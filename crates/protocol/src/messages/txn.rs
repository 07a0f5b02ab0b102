//! Transaction APIs: InitProducerId (22), AddPartitionsToTxn (24),
//! AddOffsetsToTxn (25), EndTxn (26), WriteTxnMarkers (27),
//! TxnOffsetCommit (28).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

#[derive(Debug, Clone)]
pub struct InitProducerIdRequest {
    /// Null requests an idempotence-only producer id with no transaction
    /// state.
    pub transactional_id: Option<String>,
    pub transaction_timeout_ms: i32,
}

impl InitProducerIdRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            transactional_id: buf.read_nullable_string("transactional_id")?,
            transaction_timeout_ms: buf.read_i32("transaction_timeout_ms")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_nullable_string(self.transactional_id.as_deref());
        buf.put_i32(self.transaction_timeout_ms);
    }
}

#[derive(Debug, Clone)]
pub struct InitProducerIdResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub producer_id: i64,
    pub producer_epoch: i16,
}

impl InitProducerIdResponse {
    pub fn error(error_code: i16) -> Self {
        Self {
            throttle_time_ms: 0,
            error_code,
            producer_id: -1,
            producer_epoch: -1,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_i16(self.error_code);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: buf.read_i32("throttle_time_ms")?,
            error_code: buf.read_i16("error_code")?,
            producer_id: buf.read_i64("producer_id")?,
            producer_epoch: buf.read_i16("producer_epoch")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TxnTopic {
    pub name: String,
    pub partitions: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct AddPartitionsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub topics: Vec<TxnTopic>,
}

impl AddPartitionsToTxnRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            transactional_id: buf.read_string("transactional_id")?,
            producer_id: buf.read_i64("producer_id")?,
            producer_epoch: buf.read_i16("producer_epoch")?,
            topics: buf.read_array("topics", |b| {
                Ok(TxnTopic {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| b.read_i32("partition"))?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_string(&self.transactional_id);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_array(&self.topics, |b, t| {
            b.put_string(&t.name);
            b.put_array(&t.partitions, |b, p| b.put_i32(*p));
        });
    }
}

#[derive(Debug, Clone)]
pub struct TxnPartitionResult {
    pub partition: i32,
    pub error_code: i16,
}

#[derive(Debug, Clone)]
pub struct TxnTopicResult {
    pub name: String,
    pub partitions: Vec<TxnPartitionResult>,
}

#[derive(Debug, Clone)]
pub struct AddPartitionsToTxnResponse {
    pub throttle_time_ms: i32,
    pub results: Vec<TxnTopicResult>,
}

impl AddPartitionsToTxnResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_array(&self.results, |b, t| {
            b.put_string(&t.name);
            b.put_array(&t.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i16(p.error_code);
            });
        });
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: buf.read_i32("throttle_time_ms")?,
            results: buf.read_array("results", |b| {
                Ok(TxnTopicResult {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(TxnPartitionResult {
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
pub struct AddOffsetsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub group_id: String,
}

impl AddOffsetsToTxnRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            transactional_id: buf.read_string("transactional_id")?,
            producer_id: buf.read_i64("producer_id")?,
            producer_epoch: buf.read_i16("producer_epoch")?,
            group_id: buf.read_string("group_id")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_string(&self.transactional_id);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_string(&self.group_id);
    }
}

#[derive(Debug, Clone)]
pub struct AddOffsetsToTxnResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
}

impl AddOffsetsToTxnResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_i16(self.error_code);
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: buf.read_i32("throttle_time_ms")?,
            error_code: buf.read_i16("error_code")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EndTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub committed: bool,
}

impl EndTxnRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            transactional_id: buf.read_string("transactional_id")?,
            producer_id: buf.read_i64("producer_id")?,
            producer_epoch: buf.read_i16("producer_epoch")?,
            committed: buf.read_bool("committed")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_string(&self.transactional_id);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_bool(self.committed);
    }
}

#[derive(Debug, Clone)]
pub struct EndTxnResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
}

impl EndTxnResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_i16(self.error_code);
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: buf.read_i32("throttle_time_ms")?,
            error_code: buf.read_i16("error_code")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WritableTxnMarker {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub transaction_result: bool,
    pub topics: Vec<TxnTopic>,
    pub coordinator_epoch: i32,
}

#[derive(Debug, Clone)]
pub struct WriteTxnMarkersRequest {
    pub markers: Vec<WritableTxnMarker>,
}

impl WriteTxnMarkersRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            markers: buf.read_array("markers", |b| {
                Ok(WritableTxnMarker {
                    producer_id: b.read_i64("producer_id")?,
                    producer_epoch: b.read_i16("producer_epoch")?,
                    transaction_result: b.read_bool("transaction_result")?,
                    topics: b.read_array("topics", |b| {
                        Ok(TxnTopic {
                            name: b.read_string("topic")?,
                            partitions: b.read_array("partitions", |b| b.read_i32("partition"))?,
                        })
                    })?,
                    coordinator_epoch: b.read_i32("coordinator_epoch")?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_array(&self.markers, |b, m| {
            b.put_i64(m.producer_id);
            b.put_i16(m.producer_epoch);
            b.put_bool(m.transaction_result);
            b.put_array(&m.topics, |b, t| {
                b.put_string(&t.name);
                b.put_array(&t.partitions, |b, p| b.put_i32(*p));
            });
            b.put_i32(m.coordinator_epoch);
        });
    }
}

#[derive(Debug, Clone)]
pub struct WritableTxnMarkerResult {
    pub producer_id: i64,
    pub topics: Vec<TxnTopicResult>,
}

#[derive(Debug, Clone)]
pub struct WriteTxnMarkersResponse {
    pub markers: Vec<WritableTxnMarkerResult>,
}

impl WriteTxnMarkersResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_array(&self.markers, |b, m| {
            b.put_i64(m.producer_id);
            b.put_array(&m.topics, |b, t| {
                b.put_string(&t.name);
                b.put_array(&t.partitions, |b, p| {
                    b.put_i32(p.partition);
                    b.put_i16(p.error_code);
                });
            });
        });
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            markers: buf.read_array("markers", |b| {
                Ok(WritableTxnMarkerResult {
                    producer_id: b.read_i64("producer_id")?,
                    topics: b.read_array("topics", |b| {
                        Ok(TxnTopicResult {
                            name: b.read_string("topic")?,
                            partitions: b.read_array("partitions", |b| {
                                Ok(TxnPartitionResult {
                                    partition: b.read_i32("partition")?,
                                    error_code: b.read_i16("error_code")?,
                                })
                            })?,
                        })
                    })?,
                })
            })?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TxnOffsetCommitRequest {
    pub transactional_id: String,
    pub group_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub topics: Vec<TxnOffsetCommitTopic>,
}

#[derive(Debug, Clone)]
pub struct TxnOffsetCommitTopic {
    pub name: String,
    pub partitions: Vec<TxnOffsetCommitPartition>,
}

#[derive(Debug, Clone)]
pub struct TxnOffsetCommitPartition {
    pub partition: i32,
    pub committed_offset: i64,
    pub committed_metadata: Option<String>,
}

impl TxnOffsetCommitRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            transactional_id: buf.read_string("transactional_id")?,
            group_id: buf.read_string("group_id")?,
            producer_id: buf.read_i64("producer_id")?,
            producer_epoch: buf.read_i16("producer_epoch")?,
            topics: buf.read_array("topics", |b| {
                Ok(TxnOffsetCommitTopic {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(TxnOffsetCommitPartition {
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
        buf.put_string(&self.transactional_id);
        buf.put_string(&self.group_id);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_array(&self.topics, |b, t| {
            b.put_string(&t.name);
            b.put_array(&t.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i64(p.committed_offset);
                b.put_nullable_string(p.committed_metadata.as_deref());
            });
        });
    }
}

#[derive(Debug, Clone)]
pub struct TxnOffsetCommitResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<TxnTopicResult>,
}

impl TxnOffsetCommitResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_array(&self.topics, |b, t| {
            b.put_string(&t.name);
            b.put_array(&t.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i16(p.error_code);
            });
        });
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: buf.read_i32("throttle_time_ms")?,
            topics: buf.read_array("topics", |b| {
                Ok(TxnTopicResult {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(TxnPartitionResult {
                            partition: b.read_i32("partition")?,
                            error_code: b.read_i16("error_code")?,
                        })
                    })?,
                })
            })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_producer_id_round_trip() {
        let request = InitProducerIdRequest {
            transactional_id: Some("tx-1".into()),
            transaction_timeout_ms: 60_000,
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf, 0);
        let mut b = buf.freeze();
        let decoded = InitProducerIdRequest::decode(&mut b, 0).unwrap();
        assert_eq!(decoded.transactional_id.as_deref(), Some("tx-1"));
    }

    #[test]
    fn test_write_txn_markers_round_trip() {
        let request = WriteTxnMarkersRequest {
            markers: vec![WritableTxnMarker {
                producer_id: 7,
                producer_epoch: 0,
                transaction_result: true,
                topics: vec![TxnTopic {
                    name: "t".into(),
                    partitions: vec![0, 1],
                }],
                coordinator_epoch: 1,
            }],
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf, 0);
        let mut b = buf.freeze();
        let decoded = WriteTxnMarkersRequest::decode(&mut b, 0).unwrap();
        assert!(decoded.markers[0].transaction_result);
        assert_eq!(decoded.markers[0].topics[0].partitions, vec![0, 1]);
    }
}
