//! Metadata handler: brokers, controller, topic/partition leadership.

use std::sync::Arc;

use broker_core::{validate_topic_name, ErrorCode, CONSUMER_OFFSETS_TOPIC};
use cluster::Command;
use protocol::messages::{
    MetadataBroker, MetadataPartition, MetadataRequest, MetadataResponse, MetadataTopic,
};

use crate::BrokerContext;

pub async fn handle(ctx: &Arc<BrokerContext>, request: MetadataRequest) -> MetadataResponse {
    // Auto-create requested topics that do not exist yet.
    if request.allow_auto_topic_creation {
        if let Some(names) = &request.topics {
            for name in names {
                let exists = ctx.cluster.read(|state| state.topic(name).is_some());
                if !exists && validate_topic_name(name).is_ok() && name != CONSUMER_OFFSETS_TOPIC {
                    let _ = create_default_topic(ctx, name).await;
                }
            }
        }
    }

    let state = ctx.cluster.metadata();
    let brokers: Vec<MetadataBroker> = state
        .brokers
        .iter()
        .map(|(&node_id, info)| MetadataBroker {
            node_id,
            host: info.host.clone(),
            port: info.port,
            rack: None,
        })
        .collect();

    let wanted: Vec<String> = match &request.topics {
        None => state.topics.keys().cloned().collect(),
        Some(names) => names.clone(),
    };

    let topics = wanted
        .into_iter()
        .map(|name| match state.topics.get(&name) {
            Some(meta) => MetadataTopic {
                error_code: ErrorCode::None.code(),
                is_internal: name.starts_with("__"),
                partitions: meta
                    .partitions
                    .iter()
                    .enumerate()
                    .map(|(i, p)| MetadataPartition {
                        error_code: if p.leader < 0 {
                            ErrorCode::LeaderNotAvailable.code()
                        } else {
                            ErrorCode::None.code()
                        },
                        partition_index: i as i32,
                        leader_id: p.leader,
                        replica_nodes: p.replicas.clone(),
                        isr_nodes: p.isr.clone(),
                        offline_replicas: Vec::new(),
                    })
                    .collect(),
                name,
            },
            None => MetadataTopic {
                error_code: if validate_topic_name(&name).is_err() {
                    ErrorCode::InvalidTopic.code()
                } else {
                    ErrorCode::UnknownTopicOrPartition.code()
                },
                is_internal: false,
                partitions: Vec::new(),
                name,
            },
        })
        .collect();

    MetadataResponse {
        throttle_time_ms: 0,
        brokers,
        cluster_id: None,
        controller_id: ctx.cluster.controller_id().unwrap_or(-1),
        topics,
    }
}

async fn create_default_topic(ctx: &Arc<BrokerContext>, name: &str) -> Result<(), ()> {
    let brokers: Vec<i32> = ctx.cluster.read(|state| state.brokers.keys().copied().collect());
    let brokers = if brokers.is_empty() {
        vec![ctx.cluster.broker_id()]
    } else {
        brokers
    };
    let assignments = vec![vec![brokers[0]]];
    ctx.cluster
        .propose(Command::CreateTopic {
            name: name.to_string(),
            partition_count: 1,
            replication_factor: 1,
            config: ctx.topics.default_topic_config(),
            assignments,
        })
        .await
        .map(|_| ())
        .map_err(|_| ())
}
