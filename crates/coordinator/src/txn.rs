//! Transaction coordination: producer-id allocation, per-transactional-id
//! state, and the two-phase commit that writes COMMIT/ABORT control
//! records through the ordinary replicated append path.
//!
//! The coordinator is the cluster controller; transaction state lives in
//! the control-plane state machine, so a failover controller resumes
//! in-flight transitions by replaying it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use broker_core::{TopicPartition, TransactionConfig, CONSUMER_OFFSETS_TOPIC};
use cluster::{
    ApplyData, ClusterHandle, Command, InternalClient, ReplicationManager, TxnMeta, TxnStateKind,
};
use protocol::messages::{TxnTopic, WritableTxnMarker, WriteTxnMarkersRequest};
use protocol::ControlMarker;
use storage::TopicManager;

use crate::error::{CoordinatorError, Result};
use crate::offsets::offsets_partition_for;

const MARKER_COMMIT_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct PidBlock {
    next: i64,
    remaining: i64,
}

pub struct TransactionCoordinator {
    broker_id: i32,
    config: TransactionConfig,
    offsets_topic_partitions: i32,
    cluster: ClusterHandle,
    replication: Arc<ReplicationManager>,
    topics: Arc<TopicManager>,
    pid_block: Mutex<PidBlock>,
}

impl TransactionCoordinator {
    pub fn new(
        config: TransactionConfig,
        offsets_topic_partitions: i32,
        cluster: ClusterHandle,
        replication: Arc<ReplicationManager>,
        topics: Arc<TopicManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker_id: cluster.broker_id(),
            config,
            offsets_topic_partitions,
            cluster,
            replication,
            topics,
            pid_block: Mutex::new(PidBlock::default()),
        })
    }

    /// Starts the expired-transaction sweeper.
    pub fn start(self: &Arc<Self>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                coordinator.config.abort_check_interval_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if coordinator.cluster.is_controller() {
                    coordinator.sweep_expired().await;
                }
            }
        });
    }

    fn check_coordinator(&self) -> Result<()> {
        if !self.cluster.is_controller() {
            return Err(CoordinatorError::NotCoordinator("transactions".into()));
        }
        Ok(())
    }

    /// Allocates one producer id from the replicated counter, refilling
    /// the local block as needed.
    async fn allocate_pid(&self) -> Result<i64> {
        {
            let mut block = self.pid_block.lock();
            if block.remaining > 0 {
                let pid = block.next;
                block.next += 1;
                block.remaining -= 1;
                return Ok(pid);
            }
        }
        let data = self
            .cluster
            .propose(Command::AllocateProducerIds {
                count: self.config.producer_id_block_size,
            })
            .await?;
        let ApplyData::ProducerIds { first, count } = data else {
            return Err(CoordinatorError::InvalidTxnState(
                "unexpected allocation result".into(),
            ));
        };
        let mut block = self.pid_block.lock();
        block.next = first + 1;
        block.remaining = count - 1;
        Ok(first)
    }

    /// `InitProducerId`: allocates (or re-fences) a producer identity.
    pub async fn init_producer_id(
        &self,
        transactional_id: Option<&str>,
        transaction_timeout_ms: i32,
    ) -> Result<(i64, i16)> {
        let Some(txn_id) = transactional_id else {
            // Idempotence-only producers get an id and no transaction state.
            return Ok((self.allocate_pid().await?, 0));
        };
        self.check_coordinator()?;
        if txn_id.is_empty() {
            return Err(CoordinatorError::InvalidGroupId(txn_id.into()));
        }
        if transaction_timeout_ms <= 0 || transaction_timeout_ms > self.config.max_timeout_ms {
            return Err(CoordinatorError::InvalidTransactionTimeout(
                transaction_timeout_ms,
            ));
        }

        let existing = self.cluster.read(|state| state.txn(txn_id).cloned());
        match existing {
            None => {
                let pid = self.allocate_pid().await?;
                self.persist_txn(txn_id, pid, 0, TxnStateKind::Empty, Vec::new(), 0, 0)
                    .await?;
                Ok((pid, 0))
            }
            Some(meta) => {
                match meta.state {
                    TxnStateKind::PrepareCommit | TxnStateKind::PrepareAbort => {
                        return Err(CoordinatorError::ConcurrentTransactions(txn_id.into()));
                    }
                    TxnStateKind::Ongoing => {
                        // Fence the previous instance: abort what it left open.
                        info!(txn_id, "Aborting in-flight transaction for new producer");
                        self.finish(txn_id, &meta, false).await?;
                    }
                    _ => {}
                }
                let (pid, epoch) = if meta.producer_epoch == i16::MAX {
                    (self.allocate_pid().await?, 0)
                } else {
                    (meta.producer_id, meta.producer_epoch + 1)
                };
                self.persist_txn(
                    txn_id,
                    pid,
                    epoch,
                    TxnStateKind::Empty,
                    Vec::new(),
                    meta.coordinator_epoch + 1,
                    0,
                )
                .await?;
                Ok((pid, epoch))
            }
        }
    }

    fn validate(&self, txn_id: &str, producer_id: i64, producer_epoch: i16) -> Result<TxnMeta> {
        self.check_coordinator()?;
        let meta = self
            .cluster
            .read(|state| state.txn(txn_id).cloned())
            .ok_or_else(|| CoordinatorError::InvalidProducerIdMapping(txn_id.into()))?;
        if meta.producer_id != producer_id {
            return Err(CoordinatorError::InvalidProducerIdMapping(txn_id.into()));
        }
        if producer_epoch != meta.producer_epoch {
            return Err(CoordinatorError::ProducerFenced {
                current: meta.producer_epoch,
                got: producer_epoch,
            });
        }
        Ok(meta)
    }

    /// `AddPartitionsToTxn`: Empty -> Ongoing, recording participants.
    pub async fn add_partitions(
        &self,
        txn_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        partitions: Vec<TopicPartition>,
    ) -> Result<()> {
        let meta = self.validate(txn_id, producer_id, producer_epoch)?;
        let mut participants = match meta.state {
            TxnStateKind::Ongoing => meta.partitions.clone(),
            TxnStateKind::PrepareCommit | TxnStateKind::PrepareAbort => {
                return Err(CoordinatorError::ConcurrentTransactions(txn_id.into()));
            }
            // A fresh transaction begins with this call.
            _ => Vec::new(),
        };
        for tp in partitions {
            if !participants.contains(&tp) {
                participants.push(tp);
            }
        }
        let deadline = chrono::Utc::now().timestamp_millis() + self.config.default_timeout_ms as i64;
        self.persist_txn(
            txn_id,
            producer_id,
            producer_epoch,
            TxnStateKind::Ongoing,
            participants,
            meta.coordinator_epoch,
            deadline,
        )
        .await
    }

    /// `AddOffsetsToTxn`: attaches the group's offsets partition.
    pub async fn add_offsets(
        &self,
        txn_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        group_id: &str,
    ) -> Result<()> {
        let partition = offsets_partition_for(group_id, self.offsets_topic_partitions);
        self.add_partitions(
            txn_id,
            producer_id,
            producer_epoch,
            vec![TopicPartition::new(CONSUMER_OFFSETS_TOPIC, partition)],
        )
        .await
    }

    /// `EndTxn`: PrepareCommit/PrepareAbort, markers, Complete, Empty.
    pub async fn end_txn(
        &self,
        txn_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        commit: bool,
    ) -> Result<()> {
        let meta = self.validate(txn_id, producer_id, producer_epoch)?;
        match meta.state {
            TxnStateKind::Ongoing => {}
            TxnStateKind::Empty => {
                // Committing nothing is legal and a no-op.
                return Ok(());
            }
            _ => return Err(CoordinatorError::InvalidTxnState(txn_id.into())),
        }
        self.finish(txn_id, &meta, commit).await
    }

    /// Drives a transaction from Ongoing through the marker writes to
    /// Empty.
    async fn finish(&self, txn_id: &str, meta: &TxnMeta, commit: bool) -> Result<()> {
        let prepare = if commit {
            TxnStateKind::PrepareCommit
        } else {
            TxnStateKind::PrepareAbort
        };
        self.persist_txn(
            txn_id,
            meta.producer_id,
            meta.producer_epoch,
            prepare,
            meta.partitions.clone(),
            meta.coordinator_epoch,
            meta.deadline_ms,
        )
        .await?;

        self.write_markers(
            meta.producer_id,
            meta.producer_epoch,
            commit,
            meta.coordinator_epoch,
            &meta.partitions,
        )
        .await?;

        let complete = if commit {
            TxnStateKind::CompleteCommit
        } else {
            TxnStateKind::CompleteAbort
        };
        self.persist_txn(
            txn_id,
            meta.producer_id,
            meta.producer_epoch,
            complete,
            Vec::new(),
            meta.coordinator_epoch,
            0,
        )
        .await?;
        // Terminal state persisted; the id is immediately reusable.
        self.persist_txn(
            txn_id,
            meta.producer_id,
            meta.producer_epoch,
            TxnStateKind::Empty,
            Vec::new(),
            meta.coordinator_epoch,
            0,
        )
        .await?;

        if commit {
            telemetry::metrics().txns_committed.inc();
        } else {
            telemetry::metrics().txns_aborted.inc();
        }
        info!(txn_id, commit, "Transaction finished");
        Ok(())
    }

    /// Writes the control marker to every participating partition, local
    /// or remote, and waits for each to be replicated past its marker.
    async fn write_markers(
        &self,
        producer_id: i64,
        producer_epoch: i16,
        commit: bool,
        coordinator_epoch: i32,
        partitions: &[TopicPartition],
    ) -> Result<()> {
        let mut remote: HashMap<i32, Vec<TopicPartition>> = HashMap::new();
        for tp in partitions {
            let leader = self.cluster.read(|state| state.leader_of(tp));
            match leader {
                Some(leader) if leader == self.broker_id => {
                    self.write_marker_local(tp, producer_id, producer_epoch, commit, coordinator_epoch)
                        .await?;
                }
                Some(leader) => remote.entry(leader).or_default().push(tp.clone()),
                None => {
                    return Err(CoordinatorError::NotAvailable(tp.to_string()));
                }
            }
        }

        for (leader, partitions) in remote {
            let addr = self
                .cluster
                .read(|state| state.broker_addr(leader).cloned())
                .ok_or_else(|| CoordinatorError::NotAvailable(format!("broker {leader}")))?;
            let mut topics: HashMap<String, Vec<i32>> = HashMap::new();
            for tp in &partitions {
                topics.entry(tp.topic.clone()).or_default().push(tp.partition);
            }
            let request = WriteTxnMarkersRequest {
                markers: vec![WritableTxnMarker {
                    producer_id,
                    producer_epoch,
                    transaction_result: commit,
                    topics: topics
                        .into_iter()
                        .map(|(name, partitions)| TxnTopic { name, partitions })
                        .collect(),
                    coordinator_epoch,
                }],
            };
            let mut client = InternalClient::connect(
                &format!("{}:{}", addr.host, addr.port),
                format!("txn-coordinator-{}", self.broker_id),
            )
            .await?;
            let response = client.write_txn_markers(&request).await?;
            for marker in response.markers {
                for topic in marker.topics {
                    for partition in topic.partitions {
                        if partition.error_code != 0 {
                            return Err(CoordinatorError::InvalidTxnState(format!(
                                "marker write failed on {}-{} with code {}",
                                topic.name, partition.partition, partition.error_code
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Appends one control marker to a locally led partition and waits
    /// until the high watermark passes it.
    pub async fn write_marker_local(
        &self,
        tp: &TopicPartition,
        producer_id: i64,
        producer_epoch: i16,
        commit: bool,
        coordinator_epoch: i32,
    ) -> Result<()> {
        let marker = if commit {
            ControlMarker::Commit { coordinator_epoch }
        } else {
            ControlMarker::Abort { coordinator_epoch }
        };
        let batch = marker
            .to_batch(
                producer_id,
                producer_epoch,
                chrono::Utc::now().timestamp_millis(),
            )
            .encode();
        let outcome = self.replication.append_as_leader(tp, batch).await?;

        let handle = self.topics.partition(tp).await?;
        let mut hwm = handle.shared().hwm_receiver();
        timeout(MARKER_COMMIT_WAIT, hwm.wait_for(|h| *h > outcome.last_offset))
            .await
            .map_err(|_| CoordinatorError::Timeout(format!("marker replication on {tp}")))?
            .map_err(|_| CoordinatorError::NotAvailable(tp.to_string()))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_txn(
        &self,
        txn_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        state: TxnStateKind,
        partitions: Vec<TopicPartition>,
        coordinator_epoch: i32,
        deadline_ms: i64,
    ) -> Result<()> {
        self.cluster
            .propose(Command::UpdateTxn {
                transactional_id: txn_id.to_string(),
                producer_id,
                producer_epoch,
                state,
                partitions,
                coordinator_epoch,
                deadline_ms,
            })
            .await?;
        Ok(())
    }

    /// Aborts transactions past their deadline and resumes transitions a
    /// failed coordinator left in Prepare*.
    async fn sweep_expired(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let stuck: Vec<(String, TxnMeta)> = self.cluster.read(|state| {
            state
                .txns
                .iter()
                .filter(|(_, meta)| match meta.state {
                    TxnStateKind::Ongoing => meta.deadline_ms > 0 && meta.deadline_ms < now,
                    TxnStateKind::PrepareCommit | TxnStateKind::PrepareAbort => true,
                    _ => false,
                })
                .map(|(id, meta)| (id.clone(), meta.clone()))
                .collect()
        });
        for (txn_id, meta) in stuck {
            let commit = meta.state == TxnStateKind::PrepareCommit;
            let reason = match meta.state {
                TxnStateKind::Ongoing => "expired",
                _ => "resuming prepare",
            };
            warn!(txn_id = %txn_id, reason, commit, "Sweeping transaction");
            if let Err(err) = self.finish(&txn_id, &meta, commit).await {
                warn!(txn_id = %txn_id, error = %err, "Transaction sweep failed");
            }
        }
    }
}
