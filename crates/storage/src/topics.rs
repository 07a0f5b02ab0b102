//! Topic manager: owns the set of locally hosted topics and their
//! partition writer tasks, and routes reads/writes to them.
//!
//! Which replicas this broker hosts is decided by the control plane; the
//! manager only materializes those partitions on disk. A small manifest
//! file makes single-node restarts self-contained.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use broker_core::{validate_topic_name, StorageConfig, TopicConfig, TopicPartition};

use crate::error::{Result, StorageError};
use crate::partition::PartitionHandle;

const MANIFEST_FILE: &str = "topics.json";

/// Locally hosted topic.
#[derive(Clone)]
pub struct Topic {
    pub name: String,
    pub partition_count: i32,
    pub replication_factor: i16,
    pub config: TopicConfig,
    pub is_internal: bool,
    /// Partitions hosted by this broker, keyed by partition id.
    pub partitions: BTreeMap<i32, PartitionHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TopicSpec {
    partition_count: i32,
    replication_factor: i16,
    config: TopicConfig,
    is_internal: bool,
    local_partitions: Vec<i32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    topics: BTreeMap<String, TopicSpec>,
}

pub struct TopicManager {
    topics_dir: PathBuf,
    storage_config: Arc<StorageConfig>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl TopicManager {
    pub fn new(data_dir: &std::path::Path, storage_config: Arc<StorageConfig>) -> Self {
        Self {
            topics_dir: data_dir.join("topics"),
            storage_config,
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_topic_config(&self) -> TopicConfig {
        TopicConfig::from_storage(&self.storage_config)
    }

    /// Reopens every topic in the manifest, recovering each hosted
    /// partition. Returns the number of partitions recovered.
    pub async fn recover_all(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.topics_dir).await?;
        let manifest = self.read_manifest().await;
        let mut recovered = 0usize;
        for (name, spec) in manifest.topics {
            let topic = self
                .open_topic(&name, &spec)
                .await
                .map_err(|e| {
                    warn!(topic = %name, error = %e, "Failed to recover topic");
                    e
                })?;
            recovered += topic.partitions.len();
            self.topics.write().await.insert(name, topic);
        }
        Ok(recovered)
    }

    async fn open_topic(&self, name: &str, spec: &TopicSpec) -> Result<Arc<Topic>> {
        let mut partitions = BTreeMap::new();
        for &partition in &spec.local_partitions {
            let tp = TopicPartition::new(name, partition);
            let dir = self.topics_dir.join(tp.dir_name());
            let (handle, _report) = PartitionHandle::open(
                dir,
                tp,
                spec.config.clone(),
                self.storage_config.clone(),
            )
            .await?;
            partitions.insert(partition, handle);
        }
        Ok(Arc::new(Topic {
            name: name.to_string(),
            partition_count: spec.partition_count,
            replication_factor: spec.replication_factor,
            config: spec.config.clone(),
            is_internal: name.starts_with("__"),
            partitions,
        }))
    }

    /// Creates a topic, erroring if it already exists.
    pub async fn create_topic(
        &self,
        name: &str,
        partition_count: i32,
        replication_factor: i16,
        config: TopicConfig,
        local_partitions: Vec<i32>,
    ) -> Result<Arc<Topic>> {
        validate_topic_name(name).map_err(|e| StorageError::InvalidTopic(e.to_string()))?;
        if partition_count < 1 {
            return Err(StorageError::InvalidTopic(format!(
                "partition count {partition_count} < 1"
            )));
        }
        if self.topics.read().await.contains_key(name) {
            return Err(StorageError::TopicAlreadyExists(name.to_string()));
        }
        let spec = TopicSpec {
            partition_count,
            replication_factor,
            config,
            is_internal: name.starts_with("__"),
            local_partitions,
        };
        let topic = self.open_topic(name, &spec).await?;
        {
            let mut topics = self.topics.write().await;
            if topics.contains_key(name) {
                return Err(StorageError::TopicAlreadyExists(name.to_string()));
            }
            topics.insert(name.to_string(), topic.clone());
        }
        self.persist_manifest().await?;
        info!(
            topic = %name,
            partitions = partition_count,
            replication = replication_factor,
            "Created topic"
        );
        Ok(topic)
    }

    /// Creates the topic if absent; reopens nothing if already hosted.
    /// Used when replaying control-plane state.
    pub async fn ensure_topic(
        &self,
        name: &str,
        partition_count: i32,
        replication_factor: i16,
        config: TopicConfig,
        local_partitions: Vec<i32>,
    ) -> Result<Arc<Topic>> {
        if let Some(existing) = self.topics.read().await.get(name) {
            return Ok(existing.clone());
        }
        self.create_topic(
            name,
            partition_count,
            replication_factor,
            config,
            local_partitions,
        )
        .await
    }

    /// Deletes a topic: stops its partition tasks and removes the data.
    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        let topic = self
            .topics
            .write()
            .await
            .remove(name)
            .ok_or_else(|| StorageError::UnknownTopicOrPartition(name.to_string()))?;
        for (_, handle) in &topic.partitions {
            if let Err(err) = handle.close().await {
                warn!(topic = %name, error = %err, "Error closing partition during delete");
            }
            let dir = self.topics_dir.join(handle.topic_partition().dir_name());
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                warn!(topic = %name, error = %err, "Error removing partition directory");
            }
        }
        self.persist_manifest().await?;
        info!(topic = %name, "Deleted topic");
        Ok(())
    }

    pub async fn get_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().await.get(name).cloned()
    }

    pub async fn list_topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().await.values().cloned().collect()
    }

    pub async fn topic_names(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    /// The hosted partition handle for `tp`.
    pub async fn partition(&self, tp: &TopicPartition) -> Result<PartitionHandle> {
        let topics = self.topics.read().await;
        let topic = topics
            .get(&tp.topic)
            .ok_or_else(|| StorageError::UnknownTopicOrPartition(tp.to_string()))?;
        topic
            .partitions
            .get(&tp.partition)
            .cloned()
            .ok_or_else(|| StorageError::UnknownTopicOrPartition(tp.to_string()))
    }

    /// Applies config overrides to a topic and pushes them to its
    /// partition tasks.
    pub async fn alter_topic_config(
        &self,
        name: &str,
        overrides: &[(String, Option<String>)],
    ) -> Result<()> {
        let mut topics = self.topics.write().await;
        let topic = topics
            .get(name)
            .ok_or_else(|| StorageError::UnknownTopicOrPartition(name.to_string()))?;
        let mut config = topic.config.clone();
        for (key, value) in overrides {
            let value = value
                .as_deref()
                .ok_or_else(|| StorageError::InvalidTopic(format!("null value for {key}")))?;
            config
                .set(key, value)
                .map_err(|e| StorageError::InvalidTopic(e.to_string()))?;
        }
        let mut updated = (**topic).clone();
        updated.config = config.clone();
        let updated = Arc::new(updated);
        for (_, handle) in &updated.partitions {
            handle.set_topic_config(config.clone()).await?;
        }
        topics.insert(name.to_string(), updated);
        drop(topics);
        self.persist_manifest().await?;
        Ok(())
    }

    /// Flushes and stops every partition task (graceful shutdown).
    pub async fn close_all(&self) {
        let topics: Vec<Arc<Topic>> = self.topics.read().await.values().cloned().collect();
        for topic in topics {
            for (_, handle) in &topic.partitions {
                if let Err(err) = handle.close().await {
                    warn!(
                        partition = %handle.topic_partition(),
                        error = %err,
                        "Error closing partition"
                    );
                }
            }
        }
    }

    async fn read_manifest(&self) -> Manifest {
        match tokio::fs::read(self.topics_dir.join(MANIFEST_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Manifest::default(),
        }
    }

    async fn persist_manifest(&self) -> Result<()> {
        let topics = self.topics.read().await;
        let manifest = Manifest {
            topics: topics
                .values()
                .map(|t| {
                    (
                        t.name.clone(),
                        TopicSpec {
                            partition_count: t.partition_count,
                            replication_factor: t.replication_factor,
                            config: t.config.clone(),
                            is_internal: t.is_internal,
                            local_partitions: t.partitions.keys().copied().collect(),
                        },
                    )
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StorageError::corrupt("manifest", e.to_string()))?;
        tokio::fs::write(self.topics_dir.join(MANIFEST_FILE), json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use protocol::{Record, RecordBatch};

    fn batch(value: &str) -> Bytes {
        RecordBatch::build(
            chrono::Utc::now().timestamp_millis(),
            -1,
            -1,
            -1,
            vec![Record::new(None, Some(Bytes::copy_from_slice(value.as_bytes())))],
        )
        .encode()
    }

    fn manager(dir: &std::path::Path) -> TopicManager {
        TopicManager::new(dir, Arc::new(StorageConfig::default()))
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.recover_all().await.unwrap();

        let config = mgr.default_topic_config();
        mgr.create_topic("orders", 2, 1, config.clone(), vec![0, 1])
            .await
            .unwrap();
        assert!(mgr.get_topic("orders").await.is_some());
        assert!(matches!(
            mgr.create_topic("orders", 2, 1, config.clone(), vec![0, 1]).await,
            Err(StorageError::TopicAlreadyExists(_))
        ));
        assert!(matches!(
            mgr.create_topic("bad name", 1, 1, config.clone(), vec![0]).await,
            Err(StorageError::InvalidTopic(_))
        ));
        assert!(matches!(
            mgr.create_topic("zero", 0, 1, config, vec![]).await,
            Err(StorageError::InvalidTopic(_))
        ));

        mgr.delete_topic("orders").await.unwrap();
        assert!(mgr.get_topic("orders").await.is_none());
    }

    #[tokio::test]
    async fn test_manifest_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mgr = manager(dir.path());
            mgr.recover_all().await.unwrap();
            let config = mgr.default_topic_config();
            mgr.create_topic("orders", 1, 1, config, vec![0])
                .await
                .unwrap();
            let handle = mgr
                .partition(&TopicPartition::new("orders", 0))
                .await
                .unwrap();
            handle.append_leader(batch("hello")).await.unwrap();
            mgr.close_all().await;
        }
        let mgr = manager(dir.path());
        let recovered = mgr.recover_all().await.unwrap();
        assert_eq!(recovered, 1);
        let handle = mgr
            .partition(&TopicPartition::new("orders", 0))
            .await
            .unwrap();
        assert_eq!(handle.shared().log_end_offset(), 1);
    }
}
