//! ListOffsets handler: earliest, latest, and timestamp-based lookup.

use std::sync::Arc;

use broker_core::{ErrorCode, IsolationLevel, TopicPartition};
use protocol::messages::{
    ListOffsetsPartitionResponse, ListOffsetsRequest, ListOffsetsResponse,
    ListOffsetsTopicResponse, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP,
};

use crate::BrokerContext;

pub async fn handle(ctx: &Arc<BrokerContext>, request: ListOffsetsRequest) -> ListOffsetsResponse {
    let from_follower = request.replica_id >= 0;
    let isolation = IsolationLevel::from_i8(request.isolation_level);

    let mut topics = Vec::with_capacity(request.topics.len());
    for topic in request.topics {
        let mut partitions = Vec::with_capacity(topic.partitions.len());
        for partition in topic.partitions {
            let tp = TopicPartition::new(topic.name.clone(), partition.partition);
            partitions.push(lookup(ctx, &tp, partition.timestamp, from_follower, isolation).await);
        }
        topics.push(ListOffsetsTopicResponse {
            name: topic.name,
            partitions,
        });
    }
    ListOffsetsResponse {
        throttle_time_ms: 0,
        topics,
    }
}

async fn lookup(
    ctx: &Arc<BrokerContext>,
    tp: &TopicPartition,
    timestamp: i64,
    from_follower: bool,
    isolation: IsolationLevel,
) -> ListOffsetsPartitionResponse {
    let error = |code: ErrorCode| ListOffsetsPartitionResponse {
        partition: tp.partition,
        error_code: code.code(),
        timestamp: -1,
        offset: -1,
    };

    if ctx.cluster.read(|state| state.partition(tp).is_none()) {
        return error(ErrorCode::UnknownTopicOrPartition);
    }
    if !ctx.replication.is_leader(tp) {
        return error(ErrorCode::NotLeaderForPartition);
    }
    let handle = match ctx.topics.partition(tp).await {
        Ok(handle) => handle,
        Err(err) => return error(err.error_code()),
    };
    let shared = handle.shared();

    let offset = match timestamp {
        EARLIEST_TIMESTAMP => shared.log_start_offset(),
        LATEST_TIMESTAMP => {
            if from_follower {
                shared.log_end_offset()
            } else if isolation == IsolationLevel::ReadCommitted {
                shared.last_stable_offset()
            } else {
                shared.high_watermark()
            }
        }
        target => match shared.offset_for_timestamp(target).await {
            Ok(Some(offset)) => offset,
            Ok(None) => -1,
            Err(err) => return error(err.error_code()),
        },
    };

    ListOffsetsPartitionResponse {
        partition: tp.partition,
        error_code: ErrorCode::None.code(),
        timestamp,
        offset,
    }
}
