//! Produce handler.
//!
//! acks=0: append, no response. acks=1: append + local flush, respond
//! with the assigned base offset. acks=-1: park until the high watermark
//! passes the appended batch (the min-ISR set has it) or the request
//! times out.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use broker_core::{ErrorCode, TopicPartition};
use protocol::messages::{
    ProducePartitionData, ProducePartitionResponse, ProduceRequest, ProduceResponse,
    ProduceTopicResponse,
};

use crate::BrokerContext;

pub async fn handle(
    ctx: &Arc<BrokerContext>,
    request: ProduceRequest,
    cancel: &CancellationToken,
) -> ProduceResponse {
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(request.timeout_ms.max(0) as u64);
    let acks_valid = matches!(request.acks, 0 | 1 | -1);

    let mut topics = Vec::with_capacity(request.topics.len());
    for topic in request.topics {
        let mut partitions = Vec::with_capacity(topic.partitions.len());
        for partition in topic.partitions {
            let index = partition.index;
            if !acks_valid {
                partitions.push(ProducePartitionResponse::error(
                    index,
                    ErrorCode::InvalidRequiredAcks.code(),
                ));
                continue;
            }
            let tp = TopicPartition::new(topic.name.clone(), index);
            partitions
                .push(produce_partition(ctx, tp, partition, request.acks, timeout, cancel).await);
        }
        topics.push(ProduceTopicResponse {
            name: topic.name,
            partitions,
        });
    }

    telemetry::metrics()
        .produce_latency_ms
        .observe(start.elapsed().as_millis() as u64);
    ProduceResponse {
        topics,
        throttle_time_ms: 0,
    }
}

async fn produce_partition(
    ctx: &Arc<BrokerContext>,
    tp: TopicPartition,
    partition: ProducePartitionData,
    acks: i16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProducePartitionResponse {
    let index = tp.partition;
    let error = |code: ErrorCode| ProducePartitionResponse::error(index, code.code());

    let Some(records) = partition.records else {
        return error(ErrorCode::InvalidRecord);
    };
    if records.is_empty() {
        return error(ErrorCode::InvalidRecord);
    }

    let meta = ctx
        .cluster
        .read(|state| state.partition(&tp).map(|p| p.leader));
    let Some(leader) = meta else {
        return error(ErrorCode::UnknownTopicOrPartition);
    };
    if leader != ctx.cluster.broker_id() || !ctx.replication.is_leader(&tp) {
        return error(ErrorCode::NotLeaderForPartition);
    }

    let min_isr = ctx
        .cluster
        .read(|state| state.topic(&tp.topic).map(|t| t.config.min_insync_replicas))
        .unwrap_or(1);
    if acks == -1 && ctx.replication.isr_size(&tp) < min_isr as usize {
        return error(ErrorCode::NotEnoughReplicas);
    }

    let outcome = match ctx.replication.append_as_leader(&tp, records).await {
        Ok(outcome) => outcome,
        Err(cluster::ClusterError::Storage(err)) => {
            telemetry::metrics().produce_errors.inc();
            debug!(partition = %tp, error = %err, "Produce append failed");
            return ProducePartitionResponse::error(index, err.error_code().code());
        }
        Err(err) => {
            telemetry::metrics().produce_errors.inc();
            return ProducePartitionResponse::error(index, err.error_code().code());
        }
    };

    let handle = match ctx.topics.partition(&tp).await {
        Ok(handle) => handle,
        Err(err) => return ProducePartitionResponse::error(index, err.error_code().code()),
    };

    if acks == -1 && !outcome.duplicate {
        // Park until the min-ISR set has the batch.
        let mut hwm = handle.shared().hwm_receiver();
        tokio::select! {
            waited = tokio::time::timeout(timeout, hwm.wait_for(|h| *h > outcome.last_offset)) => {
                match waited {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) => return error(ErrorCode::KafkaStorageError),
                    Err(_) => {
                        // The write happened but never became fully
                        // replicated in time.
                        let code = if ctx.replication.isr_size(&tp) < min_isr as usize {
                            ErrorCode::NotEnoughReplicasAfterAppend
                        } else {
                            ErrorCode::RequestTimedOut
                        };
                        return error(code);
                    }
                }
            }
            _ = cancel.cancelled() => return error(ErrorCode::RequestTimedOut),
        }
    }

    ProducePartitionResponse {
        index,
        error_code: ErrorCode::None.code(),
        base_offset: outcome.base_offset,
        log_append_time_ms: -1,
        log_start_offset: handle.shared().log_start_offset(),
    }
}
