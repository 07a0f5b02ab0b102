//! Transaction handlers: InitProducerId, AddPartitionsToTxn,
//! AddOffsetsToTxn, EndTxn, WriteTxnMarkers, TxnOffsetCommit.

use std::sync::Arc;

use broker_core::{ErrorCode, TopicPartition};
use coordinator::OffsetAndMetadata;
use protocol::messages::{
    AddOffsetsToTxnRequest, AddOffsetsToTxnResponse, AddPartitionsToTxnRequest,
    AddPartitionsToTxnResponse, EndTxnRequest, EndTxnResponse, InitProducerIdRequest,
    InitProducerIdResponse, TxnOffsetCommitRequest, TxnOffsetCommitResponse, TxnPartitionResult,
    TxnTopicResult, WritableTxnMarkerResult, WriteTxnMarkersRequest, WriteTxnMarkersResponse,
};

use crate::BrokerContext;

pub async fn init_producer_id(
    ctx: &Arc<BrokerContext>,
    request: InitProducerIdRequest,
) -> InitProducerIdResponse {
    match ctx
        .txns
        .init_producer_id(
            request.transactional_id.as_deref(),
            request.transaction_timeout_ms,
        )
        .await
    {
        Ok((producer_id, producer_epoch)) => InitProducerIdResponse {
            throttle_time_ms: 0,
            error_code: ErrorCode::None.code(),
            producer_id,
            producer_epoch,
        },
        Err(err) => InitProducerIdResponse::error(err.error_code().code()),
    }
}

pub async fn add_partitions(
    ctx: &Arc<BrokerContext>,
    request: AddPartitionsToTxnRequest,
) -> AddPartitionsToTxnResponse {
    // Unknown partitions fail individually before touching txn state.
    let mut unknown = Vec::new();
    let mut partitions = Vec::new();
    for topic in &request.topics {
        for &partition in &topic.partitions {
            let tp = TopicPartition::new(topic.name.clone(), partition);
            if ctx.cluster.read(|state| state.partition(&tp).is_none()) {
                unknown.push(tp);
            } else {
                partitions.push(tp);
            }
        }
    }

    let code = if unknown.is_empty() {
        match ctx
            .txns
            .add_partitions(
                &request.transactional_id,
                request.producer_id,
                request.producer_epoch,
                partitions,
            )
            .await
        {
            Ok(()) => ErrorCode::None,
            Err(err) => err.error_code(),
        }
    } else {
        ErrorCode::InvalidRequest
    };

    let results = request
        .topics
        .into_iter()
        .map(|topic| TxnTopicResult {
            partitions: topic
                .partitions
                .iter()
                .map(|&partition| {
                    let tp = TopicPartition::new(topic.name.clone(), partition);
                    TxnPartitionResult {
                        partition,
                        error_code: if unknown.contains(&tp) {
                            ErrorCode::UnknownTopicOrPartition.code()
                        } else {
                            code.code()
                        },
                    }
                })
                .collect(),
            name: topic.name,
        })
        .collect();
    AddPartitionsToTxnResponse {
        throttle_time_ms: 0,
        results,
    }
}

pub async fn add_offsets(
    ctx: &Arc<BrokerContext>,
    request: AddOffsetsToTxnRequest,
) -> AddOffsetsToTxnResponse {
    let code = match ctx
        .txns
        .add_offsets(
            &request.transactional_id,
            request.producer_id,
            request.producer_epoch,
            &request.group_id,
        )
        .await
    {
        Ok(()) => ErrorCode::None,
        Err(err) => err.error_code(),
    };
    AddOffsetsToTxnResponse {
        throttle_time_ms: 0,
        error_code: code.code(),
    }
}

pub async fn end_txn(ctx: &Arc<BrokerContext>, request: EndTxnRequest) -> EndTxnResponse {
    let code = match ctx
        .txns
        .end_txn(
            &request.transactional_id,
            request.producer_id,
            request.producer_epoch,
            request.committed,
        )
        .await
    {
        Ok(()) => ErrorCode::None,
        Err(err) => err.error_code(),
    };
    EndTxnResponse {
        throttle_time_ms: 0,
        error_code: code.code(),
    }
}

/// Writes control markers into partitions this broker leads; invoked by a
/// remote transaction coordinator.
pub async fn write_txn_markers(
    ctx: &Arc<BrokerContext>,
    request: WriteTxnMarkersRequest,
) -> WriteTxnMarkersResponse {
    let mut markers = Vec::with_capacity(request.markers.len());
    for marker in request.markers {
        let mut topics = Vec::with_capacity(marker.topics.len());
        for topic in &marker.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for &partition in &topic.partitions {
                let tp = TopicPartition::new(topic.name.clone(), partition);
                let code = if !ctx.replication.is_leader(&tp) {
                    ErrorCode::NotLeaderForPartition
                } else {
                    match ctx
                        .txns
                        .write_marker_local(
                            &tp,
                            marker.producer_id,
                            marker.producer_epoch,
                            marker.transaction_result,
                            marker.coordinator_epoch,
                        )
                        .await
                    {
                        Ok(()) => ErrorCode::None,
                        Err(err) => err.error_code(),
                    }
                };
                partitions.push(TxnPartitionResult {
                    partition,
                    error_code: code.code(),
                });
            }
            topics.push(TxnTopicResult {
                name: topic.name.clone(),
                partitions,
            });
        }
        markers.push(WritableTxnMarkerResult {
            producer_id: marker.producer_id,
            topics,
        });
    }
    WriteTxnMarkersResponse { markers }
}

pub async fn txn_offset_commit(
    ctx: &Arc<BrokerContext>,
    request: TxnOffsetCommitRequest,
) -> TxnOffsetCommitResponse {
    // Fencing first: the producer must own an open transaction that has
    // attached this group's offsets partition.
    let meta = ctx
        .cluster
        .read(|state| state.txn(&request.transactional_id).cloned());
    let code = match meta {
        None => ErrorCode::InvalidProducerIdMapping,
        Some(meta) if meta.producer_id != request.producer_id => {
            ErrorCode::InvalidProducerIdMapping
        }
        Some(meta) if meta.producer_epoch != request.producer_epoch => ErrorCode::ProducerFenced,
        Some(_) => ErrorCode::None,
    };

    let code = if code == ErrorCode::None {
        let now = chrono::Utc::now().timestamp_millis();
        let entries: Vec<(TopicPartition, OffsetAndMetadata)> = request
            .topics
            .iter()
            .flat_map(|topic| {
                topic.partitions.iter().map(|p| {
                    (
                        TopicPartition::new(topic.name.clone(), p.partition),
                        OffsetAndMetadata {
                            offset: p.committed_offset,
                            metadata: p.committed_metadata.clone(),
                            commit_timestamp: now,
                        },
                    )
                })
            })
            .collect();
        match ctx
            .groups
            .commit_offsets(&request.group_id, -1, "", entries)
            .await
        {
            Ok(code) => code,
            Err(err) => err.error_code(),
        }
    } else {
        code
    };

    TxnOffsetCommitResponse {
        throttle_time_ms: 0,
        topics: request
            .topics
            .into_iter()
            .map(|topic| TxnTopicResult {
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| TxnPartitionResult {
                        partition: p.partition,
                        error_code: code.code(),
                    })
                    .collect(),
                name: topic.name,
            })
            .collect(),
    }
}
