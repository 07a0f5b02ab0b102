//! Metadata (key 3), versions 0-5.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

/// `topics: None` means "all topics"; `Some(vec![])` (v1+) means none.
#[derive(Debug, Clone, Default)]
pub struct MetadataRequest {
    pub topics: Option<Vec<String>>,
    pub allow_auto_topic_creation: bool,
}

impl MetadataRequest {
    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let topics = if version == 0 {
            // v0 cannot express "none": an empty array asks for all topics.
            let topics = buf.read_array("topics", |b| b.read_string("topic"))?;
            if topics.is_empty() {
                None
            } else {
                Some(topics)
            }
        } else {
            buf.read_nullable_array("topics", |b| b.read_string("topic"))?
        };
        let allow_auto_topic_creation = if version >= 4 {
            buf.read_bool("allow_auto_topic_creation")?
        } else {
            true
        };
        Ok(Self {
            topics,
            allow_auto_topic_creation,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        match (&self.topics, version) {
            (None, 0) => buf.put_array::<String, _>(&[], |_, _| {}),
            (None, _) => buf.put_null_array(),
            (Some(topics), _) => buf.put_array(topics, |b, t| b.put_string(t)),
        }
        if version >= 4 {
            buf.put_bool(self.allow_auto_topic_creation);
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataBroker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MetadataPartition {
    pub error_code: i16,
    pub partition_index: i32,
    pub leader_id: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
    pub offline_replicas: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct MetadataTopic {
    pub error_code: i16,
    pub name: String,
    pub is_internal: bool,
    pub partitions: Vec<MetadataPartition>,
}

#[derive(Debug, Clone)]
pub struct MetadataResponse {
    pub throttle_time_ms: i32,
    pub brokers: Vec<MetadataBroker>,
    pub cluster_id: Option<String>,
    pub controller_id: i32,
    pub topics: Vec<MetadataTopic>,
}

impl MetadataResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 3 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_array(&self.brokers, |b, broker| {
            b.put_i32(broker.node_id);
            b.put_string(&broker.host);
            b.put_i32(broker.port);
            if version >= 1 {
                b.put_nullable_string(broker.rack.as_deref());
            }
        });
        if version >= 2 {
            buf.put_nullable_string(self.cluster_id.as_deref());
        }
        if version >= 1 {
            buf.put_i32(self.controller_id);
        }
        buf.put_array(&self.topics, |b, topic| {
            b.put_i16(topic.error_code);
            b.put_string(&topic.name);
            if version >= 1 {
                b.put_bool(topic.is_internal);
            }
            b.put_array(&topic.partitions, |b, p| {
                b.put_i16(p.error_code);
                b.put_i32(p.partition_index);
                b.put_i32(p.leader_id);
                b.put_array(&p.replica_nodes, |b, r| b.put_i32(*r));
                b.put_array(&p.isr_nodes, |b, r| b.put_i32(*r));
                if version >= 5 {
                    b.put_array(&p.offline_replicas, |b, r| b.put_i32(*r));
                }
            });
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 3 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        let brokers = buf.read_array("brokers", |b| {
            Ok(MetadataBroker {
                node_id: b.read_i32("node_id")?,
                host: b.read_string("host")?,
                port: b.read_i32("port")?,
                rack: if version >= 1 {
                    b.read_nullable_string("rack")?
                } else {
                    None
                },
            })
        })?;
        let cluster_id = if version >= 2 {
            buf.read_nullable_string("cluster_id")?
        } else {
            None
        };
        let controller_id = if version >= 1 {
            buf.read_i32("controller_id")?
        } else {
            -1
        };
        let topics = buf.read_array("topics", |b| {
            Ok(MetadataTopic {
                error_code: b.read_i16("error_code")?,
                name: b.read_string("name")?,
                is_internal: if version >= 1 {
                    b.read_bool("is_internal")?
                } else {
                    false
                },
                partitions: b.read_array("partitions", |b| {
                    Ok(MetadataPartition {
                        error_code: b.read_i16("error_code")?,
                        partition_index: b.read_i32("partition_index")?,
                        leader_id: b.read_i32("leader_id")?,
                        replica_nodes: b.read_array("replicas", |b| b.read_i32("replica"))?,
                        isr_nodes: b.read_array("isr", |b| b.read_i32("isr"))?,
                        offline_replicas: if version >= 5 {
                            b.read_array("offline", |b| b.read_i32("offline"))?
                        } else {
                            Vec::new()
                        },
                    })
                })?,
            })
        })?;
        Ok(Self {
            throttle_time_ms,
            brokers,
            cluster_id,
            controller_id,
            topics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetadataResponse {
        MetadataResponse {
            throttle_time_ms: 0,
            brokers: vec![MetadataBroker {
                node_id: 1,
                host: "localhost".into(),
                port: 9092,
                rack: None,
            }],
            cluster_id: Some("cluster-1".into()),
            controller_id: 1,
            topics: vec![MetadataTopic {
                error_code: 0,
                name: "orders".into(),
                is_internal: false,
                partitions: vec![MetadataPartition {
                    error_code: 0,
                    partition_index: 0,
                    leader_id: 1,
                    replica_nodes: vec![1, 2, 3],
                    isr_nodes: vec![1, 2],
                    offline_replicas: vec![],
                }],
            }],
        }
    }

    #[test]
    fn test_response_round_trip_all_versions() {
        for version in 0..=5 {
            let mut buf = BytesMut::new();
            sample().encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = MetadataResponse::decode(&mut b, version).unwrap();
            assert!(b.is_empty(), "trailing bytes at v{version}");
            assert_eq!(decoded.topics[0].partitions[0].replica_nodes, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_request_all_topics_encoding() {
        for version in 0..=5 {
            let req = MetadataRequest {
                topics: None,
                allow_auto_topic_creation: true,
            };
            let mut buf = BytesMut::new();
            req.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = MetadataRequest::decode(&mut b, version).unwrap();
            assert!(decoded.topics.is_none());
        }
    }
}
