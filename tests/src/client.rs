//! A minimal Kafka wire client for driving the broker in tests.
//!
//! Speaks the same typed messages as the broker and applies the standard
//! client-side read rules: control batches are skipped, and under
//! read_committed, records from aborted transactions are dropped using
//! the response's aborted-transaction ranges.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use protocol::messages::*;
use protocol::records::split_next_batch;
use protocol::{ApiKey, Record, RecordBatch, RequestHeader};

pub const READ_UNCOMMITTED: i8 = 0;
pub const READ_COMMITTED: i8 = 1;

/// A decoded application record as a consumer would see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

pub struct TestClient {
    stream: TcpStream,
    correlation: i32,
}

impl TestClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect")?;
        Ok(Self {
            stream,
            correlation: 0,
        })
    }

    async fn call(&mut self, api: ApiKey, version: i16, body: &[u8]) -> Result<Bytes> {
        self.correlation += 1;
        let header = RequestHeader {
            api_key: api.code(),
            api_version: version,
            correlation_id: self.correlation,
            client_id: Some("integration-tests".into()),
        };
        let mut frame = BytesMut::new();
        header.encode(&mut frame);
        frame.extend_from_slice(body);
        self.stream
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        self.stream.read_exact(&mut buf).await?;
        let mut response = Bytes::from(buf);
        let correlation = response.get_i32();
        if correlation != self.correlation {
            bail!("correlation mismatch: {} != {}", correlation, self.correlation);
        }
        Ok(response)
    }

    pub async fn api_versions(&mut self) -> Result<ApiVersionsResponse> {
        let mut response = self.call(ApiKey::ApiVersions, 1, &[]).await?;
        Ok(ApiVersionsResponse::decode(&mut response, 1)?)
    }

    pub async fn metadata(&mut self, topics: Option<Vec<String>>) -> Result<MetadataResponse> {
        let request = MetadataRequest {
            topics,
            allow_auto_topic_creation: false,
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 4);
        let mut response = self.call(ApiKey::Metadata, 4, &body).await?;
        Ok(MetadataResponse::decode(&mut response, 4)?)
    }

    pub async fn create_topic(
        &mut self,
        name: &str,
        partitions: i32,
        replication: i16,
        configs: Vec<(&str, &str)>,
    ) -> Result<i16> {
        let request = CreateTopicsRequest {
            topics: vec![CreatableTopic {
                name: name.into(),
                num_partitions: partitions,
                replication_factor: replication,
                assignments: vec![],
                configs: configs
                    .into_iter()
                    .map(|(k, v)| CreatableTopicConfig {
                        name: k.into(),
                        value: Some(v.into()),
                    })
                    .collect(),
            }],
            timeout_ms: 10_000,
            validate_only: false,
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 2);
        let mut response = self.call(ApiKey::CreateTopics, 2, &body).await?;
        let decoded = CreateTopicsResponse::decode(&mut response, 2)?;
        Ok(decoded.topics[0].error_code)
    }

    /// Creates a topic and waits until this broker serves produce for
    /// every partition.
    pub async fn create_topic_ready(
        &mut self,
        name: &str,
        partitions: i32,
        configs: Vec<(&str, &str)>,
    ) -> Result<()> {
        let code = self.create_topic(name, partitions, 1, configs).await?;
        if code != 0 {
            bail!("create topic failed with code {code}");
        }
        // Leadership events propagate asynchronously; probe with an empty
        // fetch until every partition answers without NOT_LEADER.
        for partition in 0..partitions {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                let response = self
                    .fetch(name, partition, 0, 1024, READ_UNCOMMITTED, 0)
                    .await?;
                let code = response.topics[0].partitions[0].error_code;
                if code == 0 {
                    break;
                }
                if tokio::time::Instant::now() > deadline {
                    bail!("partition {name}-{partition} never became leader (code {code})");
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        Ok(())
    }

    pub async fn produce_raw(
        &mut self,
        topic: &str,
        partition: i32,
        records: Bytes,
        acks: i16,
        transactional_id: Option<&str>,
    ) -> Result<ProducePartitionResponse> {
        let request = ProduceRequest {
            transactional_id: transactional_id.map(|s| s.to_string()),
            acks,
            timeout_ms: 10_000,
            topics: vec![ProduceTopicData {
                name: topic.into(),
                partitions: vec![ProducePartitionData {
                    index: partition,
                    records: Some(records),
                }],
            }],
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 5);
        let mut response = self.call(ApiKey::Produce, 5, &body).await?;
        let decoded = ProduceResponse::decode(&mut response, 5)?;
        Ok(decoded.topics[0].partitions[0].clone())
    }

    /// Produces key/value pairs as one batch with acks=-1, asserting
    /// success. Returns the assigned base offset.
    pub async fn produce(
        &mut self,
        topic: &str,
        partition: i32,
        entries: &[(&str, Option<&str>)],
    ) -> Result<i64> {
        let batch = build_batch(entries, -1, -1, -1, false);
        let response = self
            .produce_raw(topic, partition, batch, -1, None)
            .await?;
        if response.error_code != 0 {
            bail!("produce failed with code {}", response.error_code);
        }
        Ok(response.base_offset)
    }

    pub async fn fetch(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
        isolation: i8,
        max_wait_ms: i32,
    ) -> Result<FetchResponse> {
        let request = FetchRequest {
            replica_id: CONSUMER_REPLICA_ID,
            max_wait_ms,
            min_bytes: 1,
            max_bytes,
            isolation_level: isolation,
            topics: vec![FetchTopic {
                name: topic.into(),
                partitions: vec![FetchPartition {
                    partition,
                    fetch_offset: offset,
                    log_start_offset: -1,
                    partition_max_bytes: max_bytes,
                }],
            }],
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 6);
        let mut response = self.call(ApiKey::Fetch, 6, &body).await?;
        Ok(FetchResponse::decode(&mut response, 6)?)
    }

    /// Fetches and decodes application records the way a consumer does.
    pub async fn fetch_records(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
        isolation: i8,
    ) -> Result<Vec<FetchedRecord>> {
        let response = self
            .fetch(topic, partition, offset, 1 << 20, isolation, 100)
            .await?;
        let p = &response.topics[0].partitions[0];
        if p.error_code != 0 {
            bail!("fetch failed with code {}", p.error_code);
        }
        let aborted = p.aborted_transactions.clone().unwrap_or_default();
        decode_records(p.records.clone(), &aborted, isolation)
    }

    pub async fn list_offset(
        &mut self,
        topic: &str,
        partition: i32,
        timestamp: i64,
    ) -> Result<ListOffsetsPartitionResponse> {
        let request = ListOffsetsRequest {
            replica_id: -1,
            isolation_level: 0,
            topics: vec![ListOffsetsTopic {
                name: topic.into(),
                partitions: vec![ListOffsetsPartition {
                    partition,
                    timestamp,
                }],
            }],
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 2);
        let mut response = self.call(ApiKey::ListOffsets, 2, &body).await?;
        let decoded = ListOffsetsResponse::decode(&mut response, 2)?;
        Ok(decoded.topics[0].partitions[0].clone())
    }

    pub async fn find_coordinator(&mut self, key: &str, key_type: i8) -> Result<FindCoordinatorResponse> {
        let request = FindCoordinatorRequest {
            key: key.into(),
            key_type,
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 1);
        let mut response = self.call(ApiKey::FindCoordinator, 1, &body).await?;
        Ok(FindCoordinatorResponse::decode(&mut response, 1)?)
    }

    pub async fn join_group(
        &mut self,
        group: &str,
        member_id: &str,
        protocols: Vec<(&str, &[u8])>,
        session_timeout_ms: i32,
        rebalance_timeout_ms: i32,
    ) -> Result<JoinGroupResponse> {
        let request = JoinGroupRequest {
            group_id: group.into(),
            session_timeout_ms,
            rebalance_timeout_ms,
            member_id: member_id.into(),
            protocol_type: "consumer".into(),
            protocols: protocols
                .into_iter()
                .map(|(name, metadata)| JoinGroupProtocol {
                    name: name.into(),
                    metadata: Bytes::copy_from_slice(metadata),
                })
                .collect(),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 2);
        let mut response = self.call(ApiKey::JoinGroup, 2, &body).await?;
        Ok(JoinGroupResponse::decode(&mut response, 2)?)
    }

    pub async fn sync_group(
        &mut self,
        group: &str,
        generation_id: i32,
        member_id: &str,
        assignments: Vec<(String, Bytes)>,
    ) -> Result<SyncGroupResponse> {
        let request = SyncGroupRequest {
            group_id: group.into(),
            generation_id,
            member_id: member_id.into(),
            assignments: assignments
                .into_iter()
                .map(|(member_id, assignment)| SyncGroupAssignment {
                    member_id,
                    assignment,
                })
                .collect(),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 1);
        let mut response = self.call(ApiKey::SyncGroup, 1, &body).await?;
        Ok(SyncGroupResponse::decode(&mut response, 1)?)
    }

    pub async fn heartbeat(
        &mut self,
        group: &str,
        generation_id: i32,
        member_id: &str,
    ) -> Result<i16> {
        let request = HeartbeatRequest {
            group_id: group.into(),
            generation_id,
            member_id: member_id.into(),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 1);
        let mut response = self.call(ApiKey::Heartbeat, 1, &body).await?;
        Ok(HeartbeatResponse::decode(&mut response, 1)?.error_code)
    }

    pub async fn leave_group(&mut self, group: &str, member_id: &str) -> Result<i16> {
        let request = LeaveGroupRequest {
            group_id: group.into(),
            member_id: member_id.into(),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 1);
        let mut response = self.call(ApiKey::LeaveGroup, 1, &body).await?;
        Ok(LeaveGroupResponse::decode(&mut response, 1)?.error_code)
    }

    pub async fn offset_commit(
        &mut self,
        group: &str,
        generation_id: i32,
        member_id: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<i16> {
        let request = OffsetCommitRequest {
            group_id: group.into(),
            generation_id,
            member_id: member_id.into(),
            retention_time_ms: -1,
            topics: vec![OffsetCommitTopic {
                name: topic.into(),
                partitions: vec![OffsetCommitPartition {
                    partition,
                    committed_offset: offset,
                    committed_metadata: None,
                }],
            }],
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 2);
        let mut response = self.call(ApiKey::OffsetCommit, 2, &body).await?;
        let decoded = OffsetCommitResponse::decode(&mut response, 2)?;
        Ok(decoded.topics[0].partitions[0].error_code)
    }

    pub async fn offset_fetch(
        &mut self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<OffsetFetchPartitionResponse> {
        let request = OffsetFetchRequest {
            group_id: group.into(),
            topics: Some(vec![OffsetFetchTopic {
                name: topic.into(),
                partition_indexes: vec![partition],
            }]),
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 1);
        let mut response = self.call(ApiKey::OffsetFetch, 1, &body).await?;
        let decoded = OffsetFetchResponse::decode(&mut response, 1)?;
        Ok(decoded.topics[0].partitions[0].clone())
    }

    pub async fn delete_records(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<DeleteRecordsPartitionResult> {
        let request = DeleteRecordsRequest {
            topics: vec![DeleteRecordsTopic {
                name: topic.into(),
                partitions: vec![DeleteRecordsPartition { partition, offset }],
            }],
            timeout_ms: 10_000,
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 0);
        let mut response = self.call(ApiKey::DeleteRecords, 0, &body).await?;
        let decoded = DeleteRecordsResponse::decode(&mut response, 0)?;
        Ok(decoded.topics[0].partitions[0].clone())
    }

    pub async fn init_producer_id(
        &mut self,
        transactional_id: Option<&str>,
    ) -> Result<InitProducerIdResponse> {
        let request = InitProducerIdRequest {
            transactional_id: transactional_id.map(|s| s.to_string()),
            transaction_timeout_ms: 60_000,
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 0);
        let mut response = self.call(ApiKey::InitProducerId, 0, &body).await?;
        Ok(InitProducerIdResponse::decode(&mut response, 0)?)
    }

    pub async fn add_partitions_to_txn(
        &mut self,
        transactional_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        topic: &str,
        partitions: Vec<i32>,
    ) -> Result<i16> {
        let request = AddPartitionsToTxnRequest {
            transactional_id: transactional_id.into(),
            producer_id,
            producer_epoch,
            topics: vec![TxnTopic {
                name: topic.into(),
                partitions,
            }],
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 0);
        let mut response = self.call(ApiKey::AddPartitionsToTxn, 0, &body).await?;
        let decoded = AddPartitionsToTxnResponse::decode(&mut response, 0)?;
        Ok(decoded.results[0].partitions[0].error_code)
    }

    pub async fn end_txn(
        &mut self,
        transactional_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        commit: bool,
    ) -> Result<i16> {
        let request = EndTxnRequest {
            transactional_id: transactional_id.into(),
            producer_id,
            producer_epoch,
            committed: commit,
        };
        let mut body = BytesMut::new();
        request.encode(&mut body, 0);
        let mut response = self.call(ApiKey::EndTxn, 0, &body).await?;
        Ok(EndTxnResponse::decode(&mut response, 0)?.error_code)
    }
}

/// Builds one record batch the way a producer would.
pub fn build_batch(
    entries: &[(&str, Option<&str>)],
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    transactional: bool,
) -> Bytes {
    let records: Vec<Record> = entries
        .iter()
        .map(|(key, value)| {
            Record::new(
                Some(Bytes::copy_from_slice(key.as_bytes())),
                value.map(|v| Bytes::copy_from_slice(v.as_bytes())),
            )
        })
        .collect();
    let mut batch = RecordBatch::build(
        chrono::Utc::now().timestamp_millis(),
        producer_id,
        producer_epoch,
        base_sequence,
        records,
    );
    if transactional {
        batch.set_transactional();
    }
    batch.encode()
}

/// Standard consumer-side decoding: skip control batches, and under
/// read_committed drop records of aborted transactions.
pub fn decode_records(
    records: Option<Bytes>,
    aborted: &[AbortedTransaction],
    isolation: i8,
) -> Result<Vec<FetchedRecord>> {
    let mut out = Vec::new();
    let Some(mut raw) = records else {
        return Ok(out);
    };
    while let Some((header, batch_raw)) = split_next_batch(&mut raw)? {
        if header.is_control() {
            continue;
        }
        let in_aborted_range = |offset: i64| {
            isolation == READ_COMMITTED
                && aborted
                    .iter()
                    .any(|a| a.producer_id == header.producer_id && offset >= a.first_offset)
        };
        let batch = RecordBatch::decode(&mut batch_raw.clone())?;
        for record in &batch.records {
            let offset = batch.base_offset + record.offset_delta as i64;
            if header.is_transactional() && in_aborted_range(offset) {
                continue;
            }
            out.push(FetchedRecord {
                offset,
                timestamp: batch.first_timestamp + record.timestamp_delta,
                key: record.key.clone(),
                value: record.value.clone(),
            });
        }
    }
    Ok(out)
}
