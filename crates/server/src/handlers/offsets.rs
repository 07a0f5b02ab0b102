//! OffsetCommit and OffsetFetch handlers.

use std::sync::Arc;

use broker_core::{ErrorCode, TopicPartition};
use coordinator::OffsetAndMetadata;
use protocol::messages::{
    OffsetCommitPartitionResponse, OffsetCommitRequest, OffsetCommitResponse,
    OffsetCommitTopicResponse, OffsetFetchPartitionResponse, OffsetFetchRequest,
    OffsetFetchResponse, OffsetFetchTopicResponse,
};

use crate::BrokerContext;

pub async fn commit(ctx: &Arc<BrokerContext>, request: OffsetCommitRequest) -> OffsetCommitResponse {
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

    let code = match ctx
        .groups
        .commit_offsets(
            &request.group_id,
            request.generation_id,
            &request.member_id,
            entries,
        )
        .await
    {
        Ok(code) => code,
        Err(err) => err.error_code(),
    };

    OffsetCommitResponse {
        throttle_time_ms: 0,
        topics: request
            .topics
            .into_iter()
            .map(|topic| OffsetCommitTopicResponse {
                name: topic.name,
                partitions: topic
                    .partitions
                    .into_iter()
                    .map(|p| OffsetCommitPartitionResponse {
                        partition: p.partition,
                        error_code: code.code(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

pub async fn fetch(ctx: &Arc<BrokerContext>, request: OffsetFetchRequest) -> OffsetFetchResponse {
    let filter: Option<Vec<TopicPartition>> = request.topics.as_ref().map(|topics| {
        topics
            .iter()
            .flat_map(|t| {
                t.partition_indexes
                    .iter()
                    .map(|&p| TopicPartition::new(t.name.clone(), p))
            })
            .collect()
    });

    let fetched = match ctx
        .groups
        .fetch_offsets_checked(&request.group_id, filter.as_deref())
        .await
    {
        Ok(fetched) => fetched,
        Err(err) => {
            return OffsetFetchResponse {
                throttle_time_ms: 0,
                topics: Vec::new(),
                error_code: err.error_code().code(),
            };
        }
    };

    // Group the flat results back into per-topic arrays.
    let mut by_topic: Vec<OffsetFetchTopicResponse> = Vec::new();
    for (tp, value) in fetched {
        let entry = OffsetFetchPartitionResponse {
            partition: tp.partition,
            committed_offset: value.as_ref().map(|v| v.offset).unwrap_or(-1),
            metadata: value.and_then(|v| v.metadata),
            error_code: ErrorCode::None.code(),
        };
        match by_topic.iter_mut().find(|t| t.name == tp.topic) {
            Some(topic) => topic.partitions.push(entry),
            None => by_topic.push(OffsetFetchTopicResponse {
                name: tp.topic,
                partitions: vec![entry],
            }),
        }
    }

    OffsetFetchResponse {
        throttle_time_ms: 0,
        topics: by_topic,
        error_code: ErrorCode::None.code(),
    }
}
