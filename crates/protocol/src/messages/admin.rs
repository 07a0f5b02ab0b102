//! Admin APIs: CreateTopics (19), DeleteTopics (20), DeleteRecords (21),
//! DescribeConfigs (32), AlterConfigs (33).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

/// Resource type for config APIs: 2 = topic, 4 = broker.
pub const RESOURCE_TYPE_TOPIC: i8 = 2;
pub const RESOURCE_TYPE_BROKER: i8 = 4;

#[derive(Debug, Clone)]
pub struct CreatableTopicAssignment {
    pub partition_index: i32,
    pub broker_ids: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct CreatableTopicConfig {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatableTopic {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
    pub assignments: Vec<CreatableTopicAssignment>,
    pub configs: Vec<CreatableTopicConfig>,
}

#[derive(Debug, Clone)]
pub struct CreateTopicsRequest {
    pub topics: Vec<CreatableTopic>,
    pub timeout_ms: i32,
    pub validate_only: bool,
}

impl CreateTopicsRequest {
    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let topics = buf.read_array("topics", |b| {
            Ok(CreatableTopic {
                name: b.read_string("name")?,
                num_partitions: b.read_i32("num_partitions")?,
                replication_factor: b.read_i16("replication_factor")?,
                assignments: b.read_array("assignments", |b| {
                    Ok(CreatableTopicAssignment {
                        partition_index: b.read_i32("partition_index")?,
                        broker_ids: b.read_array("broker_ids", |b| b.read_i32("broker_id"))?,
                    })
                })?,
                configs: b.read_array("configs", |b| {
                    Ok(CreatableTopicConfig {
                        name: b.read_string("config_name")?,
                        value: b.read_nullable_string("config_value")?,
                    })
                })?,
            })
        })?;
        let timeout_ms = buf.read_i32("timeout_ms")?;
        let validate_only = if version >= 1 {
            buf.read_bool("validate_only")?
        } else {
            false
        };
        Ok(Self {
            topics,
            timeout_ms,
            validate_only,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_array(&self.topics, |b, t| {
            b.put_string(&t.name);
            b.put_i32(t.num_partitions);
            b.put_i16(t.replication_factor);
            b.put_array(&t.assignments, |b, a| {
                b.put_i32(a.partition_index);
                b.put_array(&a.broker_ids, |b, id| b.put_i32(*id));
            });
            b.put_array(&t.configs, |b, c| {
                b.put_string(&c.name);
                b.put_nullable_string(c.value.as_deref());
            });
        });
        buf.put_i32(self.timeout_ms);
        if version >= 1 {
            buf.put_bool(self.validate_only);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatableTopicResult {
    pub name: String,
    pub error_code: i16,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateTopicsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<CreatableTopicResult>,
}

impl CreateTopicsResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 2 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_array(&self.topics, |b, t| {
            b.put_string(&t.name);
            b.put_i16(t.error_code);
            if version >= 1 {
                b.put_nullable_string(t.error_message.as_deref());
            }
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 2 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            topics: buf.read_array("topics", |b| {
                Ok(CreatableTopicResult {
                    name: b.read_string("name")?,
                    error_code: b.read_i16("error_code")?,
                    error_message: if version >= 1 {
                        b.read_nullable_string("error_message")?
                    } else {
                        None
                    },
                })
            })?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeleteTopicsRequest {
    pub topic_names: Vec<String>,
    pub timeout_ms: i32,
}

impl DeleteTopicsRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            topic_names: buf.read_array("topic_names", |b| b.read_string("topic"))?,
            timeout_ms: buf.read_i32("timeout_ms")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_array(&self.topic_names, |b, t| b.put_string(t));
        buf.put_i32(self.timeout_ms);
    }
}

#[derive(Debug, Clone)]
pub struct DeletableTopicResult {
    pub name: String,
    pub error_code: i16,
}

#[derive(Debug, Clone)]
pub struct DeleteTopicsResponse {
    pub throttle_time_ms: i32,
    pub responses: Vec<DeletableTopicResult>,
}

impl DeleteTopicsResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_array(&self.responses, |b, t| {
            b.put_string(&t.name);
            b.put_i16(t.error_code);
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 1 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            responses: buf.read_array("responses", |b| {
                Ok(DeletableTopicResult {
                    name: b.read_string("name")?,
                    error_code: b.read_i16("error_code")?,
                })
            })?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeleteRecordsPartition {
    pub partition: i32,
    /// Records strictly below this offset become invisible; -1 means "up to
    /// the high watermark".
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct DeleteRecordsTopic {
    pub name: String,
    pub partitions: Vec<DeleteRecordsPartition>,
}

#[derive(Debug, Clone)]
pub struct DeleteRecordsRequest {
    pub topics: Vec<DeleteRecordsTopic>,
    pub timeout_ms: i32,
}

impl DeleteRecordsRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            topics: buf.read_array("topics", |b| {
                Ok(DeleteRecordsTopic {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(DeleteRecordsPartition {
                            partition: b.read_i32("partition")?,
                            offset: b.read_i64("offset")?,
                        })
                    })?,
                })
            })?,
            timeout_ms: buf.read_i32("timeout_ms")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i64(p.offset);
            });
        });
        buf.put_i32(self.timeout_ms);
    }
}

#[derive(Debug, Clone)]
pub struct DeleteRecordsPartitionResult {
    pub partition: i32,
    pub low_watermark: i64,
    pub error_code: i16,
}

#[derive(Debug, Clone)]
pub struct DeleteRecordsTopicResult {
    pub name: String,
    pub partitions: Vec<DeleteRecordsPartitionResult>,
}

#[derive(Debug, Clone)]
pub struct DeleteRecordsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<DeleteRecordsTopicResult>,
}

impl DeleteRecordsResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_array(&self.topics, |b, topic| {
            b.put_string(&topic.name);
            b.put_array(&topic.partitions, |b, p| {
                b.put_i32(p.partition);
                b.put_i64(p.low_watermark);
                b.put_i16(p.error_code);
            });
        });
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: buf.read_i32("throttle_time_ms")?,
            topics: buf.read_array("topics", |b| {
                Ok(DeleteRecordsTopicResult {
                    name: b.read_string("topic")?,
                    partitions: b.read_array("partitions", |b| {
                        Ok(DeleteRecordsPartitionResult {
                            partition: b.read_i32("partition")?,
                            low_watermark: b.read_i64("low_watermark")?,
                            error_code: b.read_i16("error_code")?,
                        })
                    })?,
                })
            })?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DescribeConfigsResource {
    pub resource_type: i8,
    pub resource_name: String,
    pub configuration_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct DescribeConfigsRequest {
    pub resources: Vec<DescribeConfigsResource>,
}

impl DescribeConfigsRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            resources: buf.read_array("resources", |b| {
                Ok(DescribeConfigsResource {
                    resource_type: b.read_i8("resource_type")?,
                    resource_name: b.read_string("resource_name")?,
                    configuration_keys: b
                        .read_nullable_array("configuration_keys", |b| b.read_string("key"))?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_array(&self.resources, |b, r| {
            b.put_i8(r.resource_type);
            b.put_string(&r.resource_name);
            match &r.configuration_keys {
                Some(keys) => b.put_array(keys, |b, k| b.put_string(k)),
                None => b.put_null_array(),
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct DescribeConfigsEntry {
    pub name: String,
    pub value: Option<String>,
    pub read_only: bool,
    pub is_default: bool,
    pub is_sensitive: bool,
}

#[derive(Debug, Clone)]
pub struct DescribeConfigsResult {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub resource_type: i8,
    pub resource_name: String,
    pub configs: Vec<DescribeConfigsEntry>,
}

#[derive(Debug, Clone)]
pub struct DescribeConfigsResponse {
    pub throttle_time_ms: i32,
    pub results: Vec<DescribeConfigsResult>,
}

impl DescribeConfigsResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_array(&self.results, |b, r| {
            b.put_i16(r.error_code);
            b.put_nullable_string(r.error_message.as_deref());
            b.put_i8(r.resource_type);
            b.put_string(&r.resource_name);
            b.put_array(&r.configs, |b, c| {
                b.put_string(&c.name);
                b.put_nullable_string(c.value.as_deref());
                b.put_bool(c.read_only);
                b.put_bool(c.is_default);
                b.put_bool(c.is_sensitive);
            });
        });
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: buf.read_i32("throttle_time_ms")?,
            results: buf.read_array("results", |b| {
                Ok(DescribeConfigsResult {
                    error_code: b.read_i16("error_code")?,
                    error_message: b.read_nullable_string("error_message")?,
                    resource_type: b.read_i8("resource_type")?,
                    resource_name: b.read_string("resource_name")?,
                    configs: b.read_array("configs", |b| {
                        Ok(DescribeConfigsEntry {
                            name: b.read_string("name")?,
                            value: b.read_nullable_string("value")?,
                            read_only: b.read_bool("read_only")?,
                            is_default: b.read_bool("is_default")?,
                            is_sensitive: b.read_bool("is_sensitive")?,
                        })
                    })?,
                })
            })?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AlterableConfig {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AlterConfigsResource {
    pub resource_type: i8,
    pub resource_name: String,
    pub configs: Vec<AlterableConfig>,
}

#[derive(Debug, Clone)]
pub struct AlterConfigsRequest {
    pub resources: Vec<AlterConfigsResource>,
    pub validate_only: bool,
}

impl AlterConfigsRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            resources: buf.read_array("resources", |b| {
                Ok(AlterConfigsResource {
                    resource_type: b.read_i8("resource_type")?,
                    resource_name: b.read_string("resource_name")?,
                    configs: b.read_array("configs", |b| {
                        Ok(AlterableConfig {
                            name: b.read_string("name")?,
                            value: b.read_nullable_string("value")?,
                        })
                    })?,
                })
            })?,
            validate_only: buf.read_bool("validate_only")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_array(&self.resources, |b, r| {
            b.put_i8(r.resource_type);
            b.put_string(&r.resource_name);
            b.put_array(&r.configs, |b, c| {
                b.put_string(&c.name);
                b.put_nullable_string(c.value.as_deref());
            });
        });
        buf.put_bool(self.validate_only);
    }
}

#[derive(Debug, Clone)]
pub struct AlterConfigsResourceResponse {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub resource_type: i8,
    pub resource_name: String,
}

#[derive(Debug, Clone)]
pub struct AlterConfigsResponse {
    pub throttle_time_ms: i32,
    pub responses: Vec<AlterConfigsResourceResponse>,
}

impl AlterConfigsResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_array(&self.responses, |b, r| {
            b.put_i16(r.error_code);
            b.put_nullable_string(r.error_message.as_deref());
            b.put_i8(r.resource_type);
            b.put_string(&r.resource_name);
        });
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: buf.read_i32("throttle_time_ms")?,
            responses: buf.read_array("responses", |b| {
                Ok(AlterConfigsResourceResponse {
                    error_code: b.read_i16("error_code")?,
                    error_message: b.read_nullable_string("error_message")?,
                    resource_type: b.read_i8("resource_type")?,
                    resource_name: b.read_string("resource_name")?,
                })
            })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_topics_round_trip() {
        let request = CreateTopicsRequest {
            topics: vec![CreatableTopic {
                name: "orders".into(),
                num_partitions: 4,
                replication_factor: 3,
                assignments: vec![],
                configs: vec![CreatableTopicConfig {
                    name: "cleanup.policy".into(),
                    value: Some("compact".into()),
                }],
            }],
            timeout_ms: 30_000,
            validate_only: false,
        };
        for version in 0..=2 {
            let mut buf = BytesMut::new();
            request.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = CreateTopicsRequest::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.topics[0].num_partitions, 4);
        }
    }

    #[test]
    fn test_delete_records_round_trip() {
        let request = DeleteRecordsRequest {
            topics: vec![DeleteRecordsTopic {
                name: "orders".into(),
                partitions: vec![DeleteRecordsPartition {
                    partition: 0,
                    offset: 100,
                }],
            }],
            timeout_ms: 5_000,
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf, 0);
        let mut b = buf.freeze();
        let decoded = DeleteRecordsRequest::decode(&mut b, 0).unwrap();
        assert_eq!(decoded.topics[0].partitions[0].offset, 100);
    }
}
