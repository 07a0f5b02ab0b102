//! Admin handlers: CreateTopics, DeleteTopics, DescribeConfigs,
//! AlterConfigs, DeleteRecords. Mutations go through the control plane;
//! reads come from the metadata view.

use std::sync::Arc;

use broker_core::{validate_topic_name, ErrorCode, TopicPartition};
use cluster::{ClusterError, Command};
use protocol::messages::{
    AlterConfigsRequest, AlterConfigsResourceResponse, AlterConfigsResponse, CreatableTopic,
    CreatableTopicResult, CreateTopicsRequest, CreateTopicsResponse, DeletableTopicResult,
    DeleteRecordsPartitionResult, DeleteRecordsRequest, DeleteRecordsResponse,
    DeleteRecordsTopicResult, DeleteTopicsRequest, DeleteTopicsResponse, DescribeConfigsEntry,
    DescribeConfigsRequest, DescribeConfigsResponse, DescribeConfigsResult, RESOURCE_TYPE_TOPIC,
};

use crate::BrokerContext;

fn rejection_code(err: &ClusterError) -> ErrorCode {
    match err {
        ClusterError::Rejected(msg) if msg.contains("already exists") => {
            ErrorCode::TopicAlreadyExists
        }
        ClusterError::Rejected(msg) if msg.contains("unknown topic") => {
            ErrorCode::UnknownTopicOrPartition
        }
        other => other.error_code(),
    }
}

pub async fn create_topics(
    ctx: &Arc<BrokerContext>,
    request: CreateTopicsRequest,
) -> CreateTopicsResponse {
    let mut results = Vec::with_capacity(request.topics.len());
    for topic in request.topics {
        let name = topic.name.clone();
        let (error_code, error_message) =
            match create_one(ctx, topic, request.validate_only).await {
                Ok(()) => (ErrorCode::None, None),
                Err((code, message)) => (code, Some(message)),
            };
        results.push(CreatableTopicResult {
            name,
            error_code: error_code.code(),
            error_message,
        });
    }
    CreateTopicsResponse {
        throttle_time_ms: 0,
        topics: results,
    }
}

async fn create_one(
    ctx: &Arc<BrokerContext>,
    topic: CreatableTopic,
    validate_only: bool,
) -> Result<(), (ErrorCode, String)> {
    validate_topic_name(&topic.name)
        .map_err(|e| (ErrorCode::InvalidTopic, e.to_string()))?;

    let brokers: Vec<i32> = ctx
        .cluster
        .read(|state| state.brokers.keys().copied().collect());
    let brokers = if brokers.is_empty() {
        vec![ctx.cluster.broker_id()]
    } else {
        brokers
    };

    let partition_count = if topic.num_partitions == -1 { 1 } else { topic.num_partitions };
    if partition_count < 1 {
        return Err((
            ErrorCode::InvalidPartitions,
            format!("partition count {partition_count} < 1"),
        ));
    }
    let replication_factor = if topic.replication_factor == -1 {
        1
    } else {
        topic.replication_factor
    };
    if replication_factor < 1 || replication_factor as usize > brokers.len() {
        return Err((
            ErrorCode::InvalidReplicationFactor,
            format!(
                "replication factor {replication_factor} outside 1..={}",
                brokers.len()
            ),
        ));
    }

    let assignments: Vec<Vec<i32>> = if topic.assignments.is_empty() {
        (0..partition_count)
            .map(|p| {
                (0..replication_factor as usize)
                    .map(|r| brokers[(p as usize + r) % brokers.len()])
                    .collect()
            })
            .collect()
    } else {
        let mut manual = topic.assignments;
        manual.sort_by_key(|a| a.partition_index);
        if manual.len() != partition_count as usize
            || manual.iter().enumerate().any(|(i, a)| a.partition_index != i as i32)
        {
            return Err((
                ErrorCode::InvalidRequest,
                "assignments must cover each partition exactly once".into(),
            ));
        }
        manual.into_iter().map(|a| a.broker_ids).collect()
    };

    let mut config = ctx.topics.default_topic_config();
    for entry in &topic.configs {
        let value = entry
            .value
            .as_deref()
            .ok_or((ErrorCode::InvalidConfig, format!("null value for {}", entry.name)))?;
        config
            .set(&entry.name, value)
            .map_err(|e| (ErrorCode::InvalidConfig, e.to_string()))?;
    }

    if validate_only {
        let exists = ctx.cluster.read(|state| state.topic(&topic.name).is_some());
        if exists {
            return Err((ErrorCode::TopicAlreadyExists, topic.name.clone()));
        }
        return Ok(());
    }

    ctx.cluster
        .propose(Command::CreateTopic {
            name: topic.name.clone(),
            partition_count,
            replication_factor,
            config,
            assignments,
        })
        .await
        .map(|_| ())
        .map_err(|err| (rejection_code(&err), err.to_string()))
}

pub async fn delete_topics(
    ctx: &Arc<BrokerContext>,
    request: DeleteTopicsRequest,
) -> DeleteTopicsResponse {
    let mut responses = Vec::with_capacity(request.topic_names.len());
    for name in request.topic_names {
        let error_code = match ctx
            .cluster
            .propose(Command::DeleteTopic { name: name.clone() })
            .await
        {
            Ok(_) => ErrorCode::None,
            Err(err) => rejection_code(&err),
        };
        responses.push(DeletableTopicResult {
            name,
            error_code: error_code.code(),
        });
    }
    DeleteTopicsResponse {
        throttle_time_ms: 0,
        responses,
    }
}

pub async fn describe_configs(
    ctx: &Arc<BrokerContext>,
    request: DescribeConfigsRequest,
) -> DescribeConfigsResponse {
    let results = request
        .resources
        .into_iter()
        .map(|resource| {
            if resource.resource_type != RESOURCE_TYPE_TOPIC {
                return DescribeConfigsResult {
                    error_code: ErrorCode::InvalidRequest.code(),
                    error_message: Some("only topic resources are supported".into()),
                    resource_type: resource.resource_type,
                    resource_name: resource.resource_name,
                    configs: Vec::new(),
                };
            }
            let config = ctx
                .cluster
                .read(|state| state.topic(&resource.resource_name).map(|t| t.config.clone()));
            match config {
                None => DescribeConfigsResult {
                    error_code: ErrorCode::UnknownTopicOrPartition.code(),
                    error_message: Some(resource.resource_name.clone()),
                    resource_type: resource.resource_type,
                    resource_name: resource.resource_name,
                    configs: Vec::new(),
                },
                Some(config) => {
                    let wanted = resource.configuration_keys.as_deref();
                    DescribeConfigsResult {
                        error_code: ErrorCode::None.code(),
                        error_message: None,
                        resource_type: resource.resource_type,
                        resource_name: resource.resource_name,
                        configs: config
                            .entries()
                            .into_iter()
                            .filter(|(key, _)| {
                                wanted.map_or(true, |keys| keys.iter().any(|k| k == key))
                            })
                            .map(|(key, value)| DescribeConfigsEntry {
                                name: key.to_string(),
                                value: Some(value),
                                read_only: false,
                                is_default: false,
                                is_sensitive: false,
                            })
                            .collect(),
                    }
                }
            }
        })
        .collect();
    DescribeConfigsResponse {
        throttle_time_ms: 0,
        results,
    }
}

pub async fn alter_configs(
    ctx: &Arc<BrokerContext>,
    request: AlterConfigsRequest,
) -> AlterConfigsResponse {
    let mut responses = Vec::with_capacity(request.resources.len());
    for resource in request.resources {
        let (error_code, error_message) = if resource.resource_type != RESOURCE_TYPE_TOPIC {
            (
                ErrorCode::InvalidRequest,
                Some("only topic resources are supported".to_string()),
            )
        } else {
            let overrides: Vec<(String, Option<String>)> = resource
                .configs
                .iter()
                .map(|c| (c.name.clone(), c.value.clone()))
                .collect();
            if request.validate_only {
                let result = ctx.cluster.read(|state| {
                    let Some(topic) = state.topic(&resource.resource_name) else {
                        return Err(ErrorCode::UnknownTopicOrPartition);
                    };
                    let mut config = topic.config.clone();
                    for (key, value) in &overrides {
                        let Some(value) = value.as_deref() else {
                            return Err(ErrorCode::InvalidConfig);
                        };
                        if config.set(key, value).is_err() {
                            return Err(ErrorCode::InvalidConfig);
                        }
                    }
                    Ok(())
                });
                match result {
                    Ok(()) => (ErrorCode::None, None),
                    Err(code) => (code, None),
                }
            } else {
                match ctx
                    .cluster
                    .propose(Command::AlterTopicConfig {
                        name: resource.resource_name.clone(),
                        overrides,
                    })
                    .await
                {
                    Ok(_) => (ErrorCode::None, None),
                    Err(err) => (rejection_code(&err), Some(err.to_string())),
                }
            }
        };
        responses.push(AlterConfigsResourceResponse {
            error_code: error_code.code(),
            error_message,
            resource_type: resource.resource_type,
            resource_name: resource.resource_name,
        });
    }
    AlterConfigsResponse {
        throttle_time_ms: 0,
        responses,
    }
}

pub async fn delete_records(
    ctx: &Arc<BrokerContext>,
    request: DeleteRecordsRequest,
) -> DeleteRecordsResponse {
    let mut topics = Vec::with_capacity(request.topics.len());
    for topic in request.topics {
        let mut partitions = Vec::with_capacity(topic.partitions.len());
        for partition in topic.partitions {
            let tp = TopicPartition::new(topic.name.clone(), partition.partition);
            let result = if !ctx.replication.is_leader(&tp) {
                Err(ErrorCode::NotLeaderForPartition)
            } else {
                match ctx.topics.partition(&tp).await {
                    Err(err) => Err(err.error_code()),
                    Ok(handle) => handle
                        .delete_records(partition.offset)
                        .await
                        .map_err(|e| e.error_code()),
                }
            };
            partitions.push(match result {
                Ok(low_watermark) => DeleteRecordsPartitionResult {
                    partition: partition.partition,
                    low_watermark,
                    error_code: ErrorCode::None.code(),
                },
                Err(code) => DeleteRecordsPartitionResult {
                    partition: partition.partition,
                    low_watermark: -1,
                    error_code: code.code(),
                },
            });
        }
        topics.push(DeleteRecordsTopicResult {
            name: topic.name,
            partitions,
        });
    }
    DeleteRecordsResponse {
        throttle_time_ms: 0,
        topics,
    }
}
