//! The per-partition writer task.
//!
//! All mutation of a partition log is serialized through one task draining
//! a command queue: appends, truncation, HWM advancement, and the periodic
//! roll/retention/compaction duties. Reads bypass the queue entirely via
//! [`PartitionShared`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use broker_core::{StorageConfig, TopicConfig, TopicPartition};

use crate::error::{Result, StorageError};
use crate::log::{AppendOutcome, PartitionLog, PartitionShared, RecoveryReport};

const COMMAND_QUEUE_DEPTH: usize = 256;

pub enum PartitionCommand {
    AppendLeader {
        records: Bytes,
        reply: oneshot::Sender<Result<AppendOutcome>>,
    },
    AppendFollower {
        records: Bytes,
        reply: oneshot::Sender<Result<i64>>,
    },
    AdvanceHwm {
        hwm: i64,
    },
    TruncateTo {
        offset: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteRecords {
        offset: i64,
        reply: oneshot::Sender<Result<i64>>,
    },
    SetLeaderEpoch {
        epoch: i32,
    },
    SetTopicConfig {
        config: TopicConfig,
    },
    Maintain,
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to one partition's writer task.
#[derive(Clone)]
pub struct PartitionHandle {
    tp: TopicPartition,
    tx: mpsc::Sender<PartitionCommand>,
    shared: Arc<PartitionShared>,
}

impl PartitionHandle {
    /// Recovers the partition directory and starts its writer task and
    /// maintenance ticker.
    pub async fn open(
        dir: PathBuf,
        tp: TopicPartition,
        topic_config: TopicConfig,
        storage_config: Arc<StorageConfig>,
    ) -> Result<(Self, RecoveryReport)> {
        let maintenance_interval = Duration::from_millis(storage_config.maintenance_interval_ms);
        let (log, report) =
            PartitionLog::open(dir, tp.clone(), topic_config, storage_config).await?;
        let shared = log.shared();

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(run_partition_task(log, rx));

        let ticker_tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if ticker_tx.send(PartitionCommand::Maintain).await.is_err() {
                    break;
                }
            }
        });

        Ok((Self { tp, tx, shared }, report))
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn shared(&self) -> &Arc<PartitionShared> {
        &self.shared
    }

    async fn send(&self, command: PartitionCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| StorageError::Offline(self.tp.to_string()))
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        rx.await
            .map_err(|_| StorageError::Offline(self.tp.to_string()))?
    }

    /// Leader-side append; returns the assigned offsets.
    pub async fn append_leader(&self, records: Bytes) -> Result<AppendOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(PartitionCommand::AppendLeader { records, reply })
            .await?;
        self.recv(rx).await
    }

    /// Replica-side append of leader-stamped batches.
    pub async fn append_follower(&self, records: Bytes) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.send(PartitionCommand::AppendFollower { records, reply })
            .await?;
        self.recv(rx).await
    }

    /// Advances the high watermark; monotone, fire-and-forget.
    pub async fn advance_hwm(&self, hwm: i64) -> Result<()> {
        self.send(PartitionCommand::AdvanceHwm { hwm }).await
    }

    pub async fn truncate_to(&self, offset: i64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(PartitionCommand::TruncateTo { offset, reply })
            .await?;
        self.recv(rx).await
    }

    /// Raises the log start offset; returns the new low watermark.
    pub async fn delete_records(&self, offset: i64) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.send(PartitionCommand::DeleteRecords { offset, reply })
            .await?;
        self.recv(rx).await
    }

    pub async fn set_leader_epoch(&self, epoch: i32) -> Result<()> {
        self.send(PartitionCommand::SetLeaderEpoch { epoch }).await
    }

    pub async fn set_topic_config(&self, config: TopicConfig) -> Result<()> {
        self.send(PartitionCommand::SetTopicConfig { config }).await
    }

    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(PartitionCommand::Flush { reply }).await?;
        self.recv(rx).await
    }

    /// Flushes, snapshots, and stops the writer task.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(PartitionCommand::Close { reply }).await?;
        self.recv(rx).await
    }
}

async fn run_partition_task(mut log: PartitionLog, mut rx: mpsc::Receiver<PartitionCommand>) {
    let tp = log.shared().tp.clone();
    debug!(partition = %tp, "Partition task started");
    while let Some(command) = rx.recv().await {
        match command {
            PartitionCommand::AppendLeader { records, reply } => {
                let _ = reply.send(log.append_leader(records).await);
            }
            PartitionCommand::AppendFollower { records, reply } => {
                let _ = reply.send(log.append_follower(records).await);
            }
            PartitionCommand::AdvanceHwm { hwm } => {
                log.advance_hwm(hwm);
            }
            PartitionCommand::TruncateTo { offset, reply } => {
                let _ = reply.send(log.truncate_to(offset).await);
            }
            PartitionCommand::DeleteRecords { offset, reply } => {
                let _ = reply.send(log.delete_records(offset).await);
            }
            PartitionCommand::SetLeaderEpoch { epoch } => {
                log.set_leader_epoch(epoch);
            }
            PartitionCommand::SetTopicConfig { config } => {
                log.set_topic_config(config);
            }
            PartitionCommand::Maintain => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                if let Err(err) = log.run_maintenance(now_ms).await {
                    error!(partition = %tp, error = %err, "Partition maintenance failed");
                }
            }
            PartitionCommand::Flush { reply } => {
                let _ = reply.send(log.flush().await);
            }
            PartitionCommand::Close { reply } => {
                let _ = reply.send(log.close().await);
                break;
            }
        }
    }
    debug!(partition = %tp, "Partition task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::ReadCeiling;
    use protocol::{Record, RecordBatch};

    fn batch(key: &str, value: &str) -> Bytes {
        RecordBatch::build(
            chrono::Utc::now().timestamp_millis(),
            -1,
            -1,
            -1,
            vec![Record::new(
                Some(Bytes::copy_from_slice(key.as_bytes())),
                Some(Bytes::copy_from_slice(value.as_bytes())),
            )],
        )
        .encode()
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageConfig::default());
        let topic_config = TopicConfig::from_storage(&storage);
        let (handle, report) = PartitionHandle::open(
            dir.path().to_path_buf(),
            TopicPartition::new("orders", 0),
            topic_config,
            storage,
        )
        .await
        .unwrap();
        assert_eq!(report.log_end_offset, 0);

        let out = handle.append_leader(batch("a", "1")).await.unwrap();
        assert_eq!(out.base_offset, 0);
        handle.advance_hwm(1).await.unwrap();

        // The watch channel wakes when the HWM advances.
        let mut hwm_rx = handle.shared().hwm_receiver();
        hwm_rx
            .wait_for(|hwm| *hwm >= 1)
            .await
            .expect("hwm watch closed");

        let slice = handle
            .shared()
            .read(0, 1 << 20, ReadCeiling::HighWatermark)
            .await
            .unwrap();
        assert!(!slice.records.is_empty());

        handle.close().await.unwrap();
        assert!(handle.append_leader(batch("b", "2")).await.is_err());
    }
}
