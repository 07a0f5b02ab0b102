//! Fetch handler: consumers and follower replicas.
//!
//! A consumer fetch is capped at the high watermark (last stable offset
//! under read_committed); a replica fetch reads to the log end and feeds
//! the leader's follower-progress tracking. When less than `min_bytes` is
//! available the request parks on the relevant watch channels and retries
//! on any advance, up to `max_wait_ms`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio_util::sync::CancellationToken;

use broker_core::{ErrorCode, IsolationLevel, TopicPartition};
use protocol::messages::{
    AbortedTransaction, FetchPartitionResponse, FetchRequest, FetchResponse, FetchTopicResponse,
};
use storage::{ReadCeiling, StorageError};

use crate::BrokerContext;

pub async fn handle(
    ctx: &Arc<BrokerContext>,
    request: FetchRequest,
    cancel: &CancellationToken,
) -> FetchResponse {
    let start = std::time::Instant::now();
    let from_follower = request.is_from_follower();
    let isolation = IsolationLevel::from_i8(request.isolation_level);
    let ceiling = if from_follower {
        ReadCeiling::LogEnd
    } else if isolation == IsolationLevel::ReadCommitted {
        ReadCeiling::LastStable
    } else {
        ReadCeiling::HighWatermark
    };
    let deadline = tokio::time::Instant::now()
        + Duration::from_millis(request.max_wait_ms.max(0) as u64);
    let min_bytes = request.min_bytes.max(0) as usize;

    // A replica fetch doubles as the follower's progress report.
    if from_follower {
        for topic in &request.topics {
            for partition in &topic.partitions {
                let tp = TopicPartition::new(topic.name.clone(), partition.partition);
                ctx.replication
                    .record_follower_fetch(&tp, request.replica_id, partition.fetch_offset)
                    .await;
            }
        }
    }

    loop {
        let (topics, total_bytes, any_error) = collect(ctx, &request, ceiling, from_follower).await;
        let now = tokio::time::Instant::now();
        if total_bytes >= min_bytes || any_error || now >= deadline {
            telemetry::metrics().fetches_served.inc();
            telemetry::metrics()
                .fetch_latency_ms
                .observe(start.elapsed().as_millis() as u64);
            return FetchResponse {
                throttle_time_ms: 0,
                topics,
            };
        }

        // Park until some requested partition advances.
        telemetry::metrics().fetches_parked.inc();
        let mut watchers = Vec::new();
        for topic in &request.topics {
            for partition in &topic.partitions {
                let tp = TopicPartition::new(topic.name.clone(), partition.partition);
                if let Ok(handle) = ctx.topics.partition(&tp).await {
                    let shared = handle.shared();
                    let mut rx = if from_follower {
                        shared.leo_receiver()
                    } else {
                        shared.hwm_receiver()
                    };
                    let target = partition.fetch_offset;
                    watchers.push(Box::pin(async move {
                        let _ = rx.wait_for(|v| *v > target).await;
                    }));
                }
            }
        }
        if watchers.is_empty() {
            // Nothing to wait on; honor max_wait then answer empty.
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = cancel.cancelled() => {
                    return FetchResponse { throttle_time_ms: 0, topics: Vec::new() };
                }
            }
            continue;
        }
        tokio::select! {
            _ = select_all(watchers) => {}
            _ = tokio::time::sleep_until(deadline) => {}
            _ = cancel.cancelled() => {
                return FetchResponse { throttle_time_ms: 0, topics: Vec::new() };
            }
        }
    }
}

async fn collect(
    ctx: &Arc<BrokerContext>,
    request: &FetchRequest,
    ceiling: ReadCeiling,
    from_follower: bool,
) -> (Vec<FetchTopicResponse>, usize, bool) {
    let mut total_bytes = 0usize;
    let mut any_error = false;
    let budget = request.max_bytes.max(1) as usize;
    let mut topics = Vec::with_capacity(request.topics.len());

    for topic in &request.topics {
        let mut partitions = Vec::with_capacity(topic.partitions.len());
        for partition in &topic.partitions {
            let tp = TopicPartition::new(topic.name.clone(), partition.partition);
            let response =
                fetch_partition(ctx, &tp, partition.fetch_offset, partition.partition_max_bytes,
                    budget.saturating_sub(total_bytes), ceiling, from_follower)
                .await;
            if response.error_code != ErrorCode::None.code() {
                any_error = true;
            }
            total_bytes += response.records_len();
            partitions.push(response);
        }
        topics.push(FetchTopicResponse {
            name: topic.name.clone(),
            partitions,
        });
    }
    (topics, total_bytes, any_error)
}

async fn fetch_partition(
    ctx: &Arc<BrokerContext>,
    tp: &TopicPartition,
    fetch_offset: i64,
    partition_max_bytes: i32,
    remaining_budget: usize,
    ceiling: ReadCeiling,
    from_follower: bool,
) -> FetchPartitionResponse {
    let index = tp.partition;
    let known = ctx.cluster.read(|state| state.partition(tp).is_some());
    if !known {
        return FetchPartitionResponse::error(index, ErrorCode::UnknownTopicOrPartition.code());
    }
    if !ctx.replication.is_leader(tp) {
        return FetchPartitionResponse::error(index, ErrorCode::NotLeaderForPartition.code());
    }
    let handle = match ctx.topics.partition(tp).await {
        Ok(handle) => handle,
        Err(err) => return FetchPartitionResponse::error(index, err.error_code().code()),
    };

    let max_bytes = (partition_max_bytes.max(0) as usize).min(remaining_budget.max(1));
    match handle.shared().read(fetch_offset, max_bytes, ceiling).await {
        Ok(slice) => FetchPartitionResponse {
            partition: index,
            error_code: ErrorCode::None.code(),
            high_watermark: slice.high_watermark,
            last_stable_offset: slice.last_stable_offset,
            log_start_offset: slice.log_start_offset,
            aborted_transactions: if from_follower || ceiling == ReadCeiling::LastStable {
                Some(
                    slice
                        .aborted
                        .iter()
                        .map(|a| AbortedTransaction {
                            producer_id: a.producer_id,
                            first_offset: a.first_offset,
                        })
                        .collect(),
                )
            } else {
                None
            },
            records: if slice.records.is_empty() {
                None
            } else {
                Some(slice.records)
            },
        },
        Err(StorageError::OffsetOutOfRange { .. }) => {
            FetchPartitionResponse::error(index, ErrorCode::OffsetOutOfRange.code())
        }
        Err(err) => FetchPartitionResponse::error(index, err.error_code().code()),
    }
}
