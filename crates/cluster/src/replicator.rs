//! Data-plane replication.
//!
//! Followers replicate by running the ordinary Fetch API against the
//! partition leader (`replica_id >= 0`); there is no second replication
//! path. The leader tracks every follower's log end offset from those
//! fetches, recomputes the high watermark as min(LEO over the ISR), and
//! records ISR membership changes through the control plane.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use broker_core::{ErrorCode, ReplicationConfig, TopicPartition};
use protocol::messages::{
    FetchPartition, FetchRequest, FetchTopic, ListOffsetsPartition, ListOffsetsRequest,
    ListOffsetsTopic, LATEST_TIMESTAMP,
};
use storage::{AppendOutcome, TopicManager};

use crate::client::InternalClient;
use crate::command::{Command, MetadataEvent};
use crate::error::{ClusterError, Result};
use crate::node::ClusterHandle;

#[derive(Debug, Clone, Copy)]
struct FollowerProgress {
    log_end_offset: i64,
    last_fetch: Instant,
    /// Last time this follower's fetch offset had reached the leader LEO.
    last_caught_up: Instant,
}

#[derive(Debug)]
struct LeaderState {
    leader_epoch: i32,
    replicas: Vec<i32>,
    isr: Vec<i32>,
    followers: HashMap<i32, FollowerProgress>,
}

/// Drives follower fetch loops and leader-side ISR/HWM bookkeeping.
pub struct ReplicationManager {
    broker_id: i32,
    cluster: ClusterHandle,
    topics: Arc<TopicManager>,
    config: ReplicationConfig,
    leaders: Mutex<HashMap<TopicPartition, LeaderState>>,
    fetchers: Mutex<HashMap<TopicPartition, JoinHandle<()>>>,
}

impl ReplicationManager {
    pub fn new(
        cluster: ClusterHandle,
        topics: Arc<TopicManager>,
        config: ReplicationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker_id: cluster.broker_id(),
            cluster,
            topics,
            config,
            leaders: Mutex::new(HashMap::new()),
            fetchers: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribes to metadata events and starts the ISR sweeper. Also
    /// syncs from the current metadata view, since boot-time events may
    /// have fired before anyone listened.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            for event in manager.cluster.read(|state| {
                state
                    .leadership_events()
                    .into_iter()
                    .collect::<Vec<MetadataEvent>>()
            }) {
                manager.handle_event(event).await;
            }
            let mut events = manager.cluster.subscribe();
            loop {
                match events.recv().await {
                    Ok(event) => manager.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Metadata event stream lagged; resyncing");
                        for event in manager
                            .cluster
                            .read(|state| state.leadership_events())
                        {
                            manager.handle_event(event).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(manager.config.isr_check_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.check_isr().await;
            }
        });
    }

    async fn handle_event(&self, event: MetadataEvent) {
        match event {
            MetadataEvent::LeadershipChanged {
                tp,
                leader,
                leader_epoch,
                replicas,
                isr,
            } => {
                if leader == self.broker_id {
                    self.become_leader(tp, leader_epoch, replicas, isr).await;
                } else if replicas.contains(&self.broker_id) {
                    self.become_follower(tp, leader_epoch).await;
                } else {
                    self.leaders.lock().remove(&tp);
                    self.stop_fetcher(&tp);
                }
            }
            MetadataEvent::TopicDeleted { name } => {
                let doomed: Vec<TopicPartition> = {
                    let fetchers = self.fetchers.lock();
                    fetchers
                        .keys()
                        .filter(|tp| tp.topic == name)
                        .cloned()
                        .collect()
                };
                for tp in doomed {
                    self.stop_fetcher(&tp);
                }
                self.leaders.lock().retain(|tp, _| tp.topic != name);
            }
            MetadataEvent::TopicCreated { .. } => {}
        }
    }

    async fn become_leader(
        &self,
        tp: TopicPartition,
        leader_epoch: i32,
        replicas: Vec<i32>,
        isr: Vec<i32>,
    ) {
        self.stop_fetcher(&tp);
        let already_leading = {
            let mut leaders = self.leaders.lock();
            if leaders.get(&tp).map(|s| s.leader_epoch) == Some(leader_epoch) {
                true
            } else {
                let now = Instant::now();
                let followers = replicas
                    .iter()
                    .filter(|&&r| r != self.broker_id)
                    .map(|&r| {
                        (
                            r,
                            FollowerProgress {
                                log_end_offset: 0,
                                last_fetch: now,
                                last_caught_up: now,
                            },
                        )
                    })
                    .collect();
                leaders.insert(
                    tp.clone(),
                    LeaderState {
                        leader_epoch,
                        replicas,
                        isr,
                        followers,
                    },
                );
                false
            }
        };
        if !already_leading {
            info!(partition = %tp, leader_epoch, "Became partition leader");
            if let Ok(handle) = self.topics.partition(&tp).await {
                let _ = handle.set_leader_epoch(leader_epoch).await;
                // With a single in-sync replica the HWM rides the LEO.
                self.recompute_hwm(&tp).await;
            }
        }
    }

    async fn become_follower(&self, tp: TopicPartition, leader_epoch: i32) {
        self.leaders.lock().remove(&tp);
        self.stop_fetcher(&tp);
        let Ok(handle) = self.topics.partition(&tp).await else {
            // Not hosted here yet; the topic-create path will retry.
            return;
        };
        let _ = handle.set_leader_epoch(leader_epoch).await;

        info!(partition = %tp, leader_epoch, "Starting replica fetcher");
        let manager = ReplicaFetcher {
            broker_id: self.broker_id,
            tp: tp.clone(),
            cluster: self.cluster.clone(),
            topics: self.topics.clone(),
            config: self.config.clone(),
        };
        let task = tokio::spawn(async move { manager.run().await });
        if let Some(previous) = self.fetchers.lock().insert(tp, task) {
            previous.abort();
        }
    }

    fn stop_fetcher(&self, tp: &TopicPartition) {
        if let Some(task) = self.fetchers.lock().remove(tp) {
            task.abort();
            debug!(partition = %tp, "Stopped replica fetcher");
        }
    }

    /// Whether this broker currently leads `tp`.
    pub fn is_leader(&self, tp: &TopicPartition) -> bool {
        self.leaders.lock().contains_key(tp)
    }

    /// Current ISR size for a led partition.
    pub fn isr_size(&self, tp: &TopicPartition) -> usize {
        self.leaders.lock().get(tp).map(|l| l.isr.len()).unwrap_or(0)
    }

    /// Appends to a partition this broker leads and advances the HWM per
    /// the current ISR.
    pub async fn append_as_leader(
        &self,
        tp: &TopicPartition,
        records: bytes::Bytes,
    ) -> Result<AppendOutcome> {
        let handle = self.topics.partition(tp).await?;
        let outcome = handle.append_leader(records).await?;
        self.recompute_hwm(tp).await;
        Ok(outcome)
    }

    /// Records a follower's fetch position (its LEO) and advances the HWM.
    pub async fn record_follower_fetch(&self, tp: &TopicPartition, replica_id: i32, fetch_offset: i64) {
        let leader_leo = match self.topics.partition(tp).await {
            Ok(handle) => handle.shared().log_end_offset(),
            Err(_) => return,
        };
        {
            let mut leaders = self.leaders.lock();
            let Some(state) = leaders.get_mut(tp) else { return };
            let now = Instant::now();
            let progress = state
                .followers
                .entry(replica_id)
                .or_insert(FollowerProgress {
                    log_end_offset: 0,
                    last_fetch: now,
                    last_caught_up: now,
                });
            progress.log_end_offset = progress.log_end_offset.max(fetch_offset);
            progress.last_fetch = now;
            if fetch_offset >= leader_leo {
                progress.last_caught_up = now;
            }
        }
        telemetry::metrics().replica_fetches.inc();
        self.recompute_hwm(tp).await;
    }

    /// HWM = min(LEO across the ISR), evaluated against the ISR as of now.
    async fn recompute_hwm(&self, tp: &TopicPartition) {
        let Ok(handle) = self.topics.partition(tp).await else { return };
        let leader_leo = handle.shared().log_end_offset();
        let new_hwm = {
            let leaders = self.leaders.lock();
            let Some(state) = leaders.get(tp) else { return };
            state
                .isr
                .iter()
                .map(|&replica| {
                    if replica == self.broker_id {
                        leader_leo
                    } else {
                        state
                            .followers
                            .get(&replica)
                            .map(|f| f.log_end_offset)
                            .unwrap_or(0)
                    }
                })
                .min()
                .unwrap_or(leader_leo)
        };
        let _ = handle.advance_hwm(new_hwm).await;
    }

    /// Periodic ISR shrink/expand, recorded through the control plane.
    async fn check_isr(&self) {
        let lag_max = Duration::from_millis(self.config.replica_lag_time_max_ms);
        let mut proposals = Vec::new();
        {
            let leaders = self.leaders.lock();
            for (tp, state) in leaders.iter() {
                let mut isr: Vec<i32> = state.isr.clone();
                let before = isr.len();
                isr.retain(|&replica| {
                    replica == self.broker_id
                        || state
                            .followers
                            .get(&replica)
                            .map(|f| f.last_caught_up.elapsed() < lag_max)
                            .unwrap_or(false)
                });
                let shrunk = isr.len() < before;

                let mut expanded = false;
                for (&replica, progress) in &state.followers {
                    if !isr.contains(&replica)
                        && progress.last_caught_up.elapsed() < lag_max
                        && state.replicas.contains(&replica)
                    {
                        isr.push(replica);
                        expanded = true;
                    }
                }
                if shrunk || expanded {
                    isr.sort_unstable();
                    proposals.push((tp.clone(), state.leader_epoch, isr, shrunk));
                }
            }
        }
        for (tp, leader_epoch, isr, shrunk) in proposals {
            if shrunk {
                telemetry::metrics().isr_shrinks.inc();
            } else {
                telemetry::metrics().isr_expands.inc();
            }
            info!(partition = %tp, isr = ?isr, "Recording ISR change");
            let result = self
                .cluster
                .propose(Command::UpdateIsr {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    leader: self.broker_id,
                    leader_epoch,
                    isr: isr.clone(),
                })
                .await;
            match result {
                Ok(_) => {
                    if let Some(state) = self.leaders.lock().get_mut(&tp) {
                        state.isr = isr;
                    }
                    self.recompute_hwm(&tp).await;
                }
                Err(err) => warn!(partition = %tp, error = %err, "ISR update failed"),
            }
        }

        let under_replicated = {
            let leaders = self.leaders.lock();
            leaders
                .values()
                .filter(|s| s.isr.len() < s.replicas.len())
                .count()
        };
        telemetry::metrics()
            .under_replicated_partitions
            .set(under_replicated as u64);
    }

    /// Stops every fetcher (graceful shutdown).
    pub fn shutdown(&self) {
        let mut fetchers = self.fetchers.lock();
        for (_, task) in fetchers.drain() {
            task.abort();
        }
    }
}

/// One follower's fetch loop for one partition.
struct ReplicaFetcher {
    broker_id: i32,
    tp: TopicPartition,
    cluster: ClusterHandle,
    topics: Arc<TopicManager>,
    config: ReplicationConfig,
}

impl ReplicaFetcher {
    async fn run(self) {
        loop {
            if let Err(err) = self.fetch_session().await {
                debug!(partition = %self.tp, error = %err, "Replica fetch session ended");
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    fn leader_addr(&self) -> Result<(i32, String)> {
        self.cluster.read(|state| {
            let leader = state
                .leader_of(&self.tp)
                .ok_or(ClusterError::NotController { leader: None })?;
            let info = state
                .broker_addr(leader)
                .ok_or(ClusterError::PeerUnreachable(leader, "no address".into()))?;
            Ok((leader, format!("{}:{}", info.host, info.port)))
        })
    }

    async fn fetch_session(&self) -> Result<()> {
        let (leader, addr) = self.leader_addr()?;
        if leader == self.broker_id {
            // Leadership flipped to us; the manager will abort this task.
            tokio::time::sleep(Duration::from_millis(500)).await;
            return Ok(());
        }
        let handle = self.topics.partition(&self.tp).await?;
        let mut client =
            InternalClient::connect(&addr, format!("replica-{}", self.broker_id)).await?;
        debug!(partition = %self.tp, leader, "Replica fetch session established");

        loop {
            let shared = handle.shared();
            let fetch_offset = shared.log_end_offset();
            let request = FetchRequest {
                replica_id: self.broker_id,
                max_wait_ms: self.config.replica_fetch_wait_ms as i32,
                min_bytes: 1,
                max_bytes: self.config.replica_fetch_max_bytes,
                isolation_level: 0,
                topics: vec![FetchTopic {
                    name: self.tp.topic.clone(),
                    partitions: vec![FetchPartition {
                        partition: self.tp.partition,
                        fetch_offset,
                        log_start_offset: shared.log_start_offset(),
                        partition_max_bytes: self.config.replica_fetch_max_bytes,
                    }],
                }],
            };
            let response = client.fetch(&request).await?;
            let partition = response
                .topics
                .first()
                .and_then(|t| t.partitions.first())
                .ok_or_else(|| ClusterError::Corrupt("empty fetch response".into()))?;

            match partition.error_code {
                code if code == ErrorCode::None.code() => {
                    if let Some(records) = &partition.records {
                        if !records.is_empty() {
                            handle.append_follower(records.clone()).await?;
                        }
                    }
                    let local_leo = handle.shared().log_end_offset();
                    let _ = handle
                        .advance_hwm(partition.high_watermark.min(local_leo))
                        .await;
                }
                code if code == ErrorCode::OffsetOutOfRange.code() => {
                    // Diverged from the leader: truncate to its LEO and
                    // retry from there.
                    let leader_leo = self.leader_log_end(&mut client).await?;
                    let target = leader_leo.min(fetch_offset);
                    warn!(
                        partition = %self.tp,
                        fetch_offset,
                        leader_leo,
                        target,
                        "Replica diverged; truncating"
                    );
                    telemetry::metrics().truncations.inc();
                    handle.truncate_to(target).await?;
                }
                code if code == ErrorCode::NotLeaderForPartition.code()
                    || code == ErrorCode::UnknownTopicOrPartition.code() =>
                {
                    // Stale leadership view; re-resolve.
                    return Err(ClusterError::RemoteError(code));
                }
                code => return Err(ClusterError::RemoteError(code)),
            }
        }
    }

    async fn leader_log_end(&self, client: &mut InternalClient) -> Result<i64> {
        let request = ListOffsetsRequest {
            replica_id: self.broker_id,
            isolation_level: 0,
            topics: vec![ListOffsetsTopic {
                name: self.tp.topic.clone(),
                partitions: vec![ListOffsetsPartition {
                    partition: self.tp.partition,
                    timestamp: LATEST_TIMESTAMP,
                }],
            }],
        };
        let response = client.list_offsets(&request).await?;
        response
            .topics
            .first()
            .and_then(|t| t.partitions.first())
            .map(|p| p.offset)
            .ok_or_else(|| ClusterError::Corrupt("empty list offsets response".into()))
    }
}
