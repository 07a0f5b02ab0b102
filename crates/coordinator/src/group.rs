//! Consumer group coordination.
//!
//! Every group is serialized through its own task: joins, syncs,
//! heartbeats, leaves, commit validation, and session expiry all run
//! there, so group state never needs a lock. The coordinator for a group
//! is the broker leading the `__consumer_offsets` partition the group
//! hashes to; offsets and group metadata are persisted by appending to
//! that partition.
//!
//! Rebalance state machine:
//!
//! ```text
//! Empty -join-> PreparingRebalance -(all joined | timeout)->
//!     CompletingRebalance -(leader SyncGroup)-> Stable
//! Stable -(join | leave | session expiry)-> PreparingRebalance
//! Stable -(all leave)-> Empty
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use broker_core::{ErrorCode, GroupConfig, TopicPartition, CONSUMER_OFFSETS_TOPIC};
use cluster::{ClusterHandle, Command, ReplicationManager};
use protocol::messages::{
    DescribedGroup, DescribedGroupMember, JoinGroupMember, JoinGroupProtocol, JoinGroupRequest,
    JoinGroupResponse, ListedGroup, SyncGroupRequest, SyncGroupResponse,
};
use protocol::RecordBatch;
use storage::{ReadCeiling, TopicManager};

use crate::error::{CoordinatorError, Result};
use crate::offsets::{
    encode_group_metadata, encode_offset_commit, offsets_partition_for, GroupMetadataMember,
    GroupMetadataValue, OffsetAndMetadata, OffsetStore,
};

const GROUP_CHANNEL_DEPTH: usize = 64;
const EXPIRY_TICK: Duration = Duration::from_millis(500);
/// Empty groups with no committed offsets are reaped after this long.
const DEAD_GROUP_GRACE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Empty,
    PreparingRebalance,
    CompletingRebalance,
    Stable,
    Dead,
}

impl GroupState {
    fn name(self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::PreparingRebalance => "PreparingRebalance",
            Self::CompletingRebalance => "CompletingRebalance",
            Self::Stable => "Stable",
            Self::Dead => "Dead",
        }
    }
}

struct Member {
    id: String,
    client_id: String,
    client_host: String,
    session_timeout_ms: i32,
    rebalance_timeout_ms: i32,
    protocols: Vec<JoinGroupProtocol>,
    assignment: Bytes,
    last_heartbeat: Instant,
    join_seq: u64,
    /// Joined the in-flight rebalance.
    rejoined: bool,
    pending_join: Option<oneshot::Sender<JoinGroupResponse>>,
    pending_sync: Option<oneshot::Sender<SyncGroupResponse>>,
}

impl Member {
    fn supports(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p.name == protocol)
    }

    fn metadata_for(&self, protocol: &str) -> Bytes {
        self.protocols
            .iter()
            .find(|p| p.name == protocol)
            .map(|p| p.metadata.clone())
            .unwrap_or_default()
    }
}

enum GroupCmd {
    Join {
        request: JoinGroupRequest,
        client_id: String,
        client_host: String,
        reply: oneshot::Sender<JoinGroupResponse>,
    },
    Sync {
        request: SyncGroupRequest,
        reply: oneshot::Sender<SyncGroupResponse>,
    },
    Heartbeat {
        generation_id: i32,
        member_id: String,
        reply: oneshot::Sender<ErrorCode>,
    },
    Leave {
        member_id: String,
        reply: oneshot::Sender<ErrorCode>,
    },
    ValidateCommit {
        generation_id: i32,
        member_id: String,
        reply: oneshot::Sender<ErrorCode>,
    },
    Describe {
        reply: oneshot::Sender<DescribedGroup>,
    },
    Tick,
}

#[derive(Clone)]
struct GroupCtx {
    config: GroupConfig,
    replication: Arc<ReplicationManager>,
    store: Arc<OffsetStore>,
    offsets_tp: TopicPartition,
}

/// The group coordinator hosted by this broker.
pub struct GroupCoordinator {
    broker_id: i32,
    config: GroupConfig,
    cluster: ClusterHandle,
    replication: Arc<ReplicationManager>,
    topics: Arc<TopicManager>,
    store: Arc<OffsetStore>,
    groups: Mutex<HashMap<String, mpsc::Sender<GroupCmd>>>,
    replayed: Mutex<std::collections::HashSet<i32>>,
    coordinator_dir: std::path::PathBuf,
}

impl GroupCoordinator {
    pub fn new(
        config: GroupConfig,
        cluster: ClusterHandle,
        replication: Arc<ReplicationManager>,
        topics: Arc<TopicManager>,
        data_dir: &std::path::Path,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker_id: cluster.broker_id(),
            config,
            cluster,
            replication,
            topics,
            store: Arc::new(OffsetStore::new()),
            groups: Mutex::new(HashMap::new()),
            replayed: Mutex::new(std::collections::HashSet::new()),
            coordinator_dir: data_dir.join("coordinator"),
        })
    }

    /// Seeds the offset store from the on-disk snapshot; the offsets topic
    /// replay remains the authority.
    pub async fn load_snapshot(&self) {
        self.store.load_from(&self.coordinator_dir).await;
    }

    /// Writes the group-state snapshot (graceful shutdown).
    pub async fn persist_snapshot(&self) {
        if let Err(err) = self.store.persist_to(&self.coordinator_dir).await {
            warn!(error = %err, "Failed to persist coordinator snapshot");
        }
    }

    /// Starts the session-expiry ticker.
    pub fn start(self: &Arc<Self>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let handles: Vec<mpsc::Sender<GroupCmd>> =
                    coordinator.groups.lock().values().cloned().collect();
                for handle in handles {
                    let _ = handle.try_send(GroupCmd::Tick);
                }
            }
        });
    }

    /// Creates the internal offsets topic on first boot (controller only).
    pub async fn ensure_offsets_topic(&self) -> Result<()> {
        if self
            .cluster
            .read(|state| state.topic(CONSUMER_OFFSETS_TOPIC).is_some())
        {
            return Ok(());
        }
        let brokers: Vec<i32> = self.cluster.read(|state| state.brokers.keys().copied().collect());
        let brokers = if brokers.is_empty() {
            vec![self.broker_id]
        } else {
            brokers
        };
        let replication_factor = brokers.len().min(3) as i16;
        let partitions = self.config.offsets_topic_partitions;
        let assignments: Vec<Vec<i32>> = (0..partitions)
            .map(|p| {
                (0..replication_factor as usize)
                    .map(|r| brokers[(p as usize + r) % brokers.len()])
                    .collect()
            })
            .collect();
        let mut config = self.topics.default_topic_config();
        config.cleanup_policy = broker_core::CleanupPolicy::Compact;
        match self
            .cluster
            .propose(Command::CreateTopic {
                name: CONSUMER_OFFSETS_TOPIC.to_string(),
                partition_count: partitions,
                replication_factor,
                config,
                assignments,
            })
            .await
        {
            Ok(_) => {
                info!(partitions, "Created internal offsets topic");
                Ok(())
            }
            Err(cluster::ClusterError::Rejected(msg)) if msg.contains("already exists") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// The offsets partition (and thus coordinator) for a group.
    pub fn offsets_partition(&self, group_id: &str) -> TopicPartition {
        TopicPartition::new(
            CONSUMER_OFFSETS_TOPIC,
            offsets_partition_for(group_id, self.config.offsets_topic_partitions),
        )
    }

    /// Whether this broker currently coordinates `group_id`, per the
    /// cluster metadata (the authority on partition leadership).
    pub fn is_coordinator_for(&self, group_id: &str) -> bool {
        self.coordinator_broker(group_id) == Some(self.broker_id)
    }

    /// Broker id currently coordinating `group_id`, per cluster metadata.
    pub fn coordinator_broker(&self, group_id: &str) -> Option<i32> {
        let tp = self.offsets_partition(group_id);
        self.cluster.read(|state| state.leader_of(&tp))
    }

    fn check_coordinator(&self, group_id: &str) -> Result<()> {
        if group_id.is_empty() {
            return Err(CoordinatorError::InvalidGroupId(group_id.to_string()));
        }
        if !self.is_coordinator_for(group_id) {
            return Err(CoordinatorError::NotCoordinator(group_id.to_string()));
        }
        Ok(())
    }

    /// Replays the hosted offsets partition into memory once per
    /// leadership session (cold start).
    async fn ensure_replayed(&self, partition: i32) -> Result<()> {
        if self.replayed.lock().contains(&partition) {
            return Ok(());
        }
        let tp = TopicPartition::new(CONSUMER_OFFSETS_TOPIC, partition);
        let handle = self.topics.partition(&tp).await?;
        let shared = handle.shared();
        let start = shared.log_start_offset();
        let end = shared.log_end_offset();
        let mut cursor = start;
        let mut replayed = 0;
        while cursor < end {
            let slice = shared.read(cursor, 8 * 1024 * 1024, ReadCeiling::LogEnd).await?;
            if slice.records.is_empty() {
                break;
            }
            let mut walk = slice.records.clone();
            while let Some((header, _)) = protocol::records::split_next_batch(&mut walk)? {
                cursor = header.next_offset();
            }
            replayed += self.store.replay(slice.records)?;
        }
        if replayed > 0 {
            info!(partition, replayed, "Replayed offsets partition");
        }
        self.replayed.lock().insert(partition);
        Ok(())
    }

    async fn group_handle(&self, group_id: &str) -> Result<mpsc::Sender<GroupCmd>> {
        self.check_coordinator(group_id)?;
        let tp = self.offsets_partition(group_id);
        self.ensure_replayed(tp.partition).await?;

        {
            let mut groups = self.groups.lock();
            if let Some(handle) = groups.get(group_id) {
                if handle.is_closed() {
                    // The task reaped itself; start fresh below.
                    groups.remove(group_id);
                    telemetry::metrics().active_groups.dec();
                    self.store.remove_group(group_id);
                } else {
                    return Ok(handle.clone());
                }
            }
        }
        let (tx, rx) = mpsc::channel(GROUP_CHANNEL_DEPTH);
        let mut task = GroupTask::new(
            group_id.to_string(),
            GroupCtx {
                config: self.config.clone(),
                replication: self.replication.clone(),
                store: self.store.clone(),
                offsets_tp: tp,
            },
        );
        if let Some(recovered) = self.store.recovered_group(group_id) {
            task.restore(recovered);
        }
        let group_id = group_id.to_string();
        {
            let mut groups = self.groups.lock();
            if let Some(handle) = groups.get(&group_id) {
                return Ok(handle.clone());
            }
            groups.insert(group_id.clone(), tx.clone());
        }
        telemetry::metrics().active_groups.inc();
        tokio::spawn(async move {
            task.run(rx).await;
        });
        Ok(tx)
    }

    async fn send_cmd<T>(
        &self,
        handle: &mpsc::Sender<GroupCmd>,
        cmd: GroupCmd,
        rx: oneshot::Receiver<T>,
        group_id: &str,
    ) -> Result<T> {
        handle
            .send(cmd)
            .await
            .map_err(|_| CoordinatorError::NotAvailable(group_id.to_string()))?;
        rx.await
            .map_err(|_| CoordinatorError::NotAvailable(group_id.to_string()))
    }

    pub async fn join_group(
        &self,
        request: JoinGroupRequest,
        client_id: String,
        client_host: String,
    ) -> Result<JoinGroupResponse> {
        let group_id = request.group_id.clone();
        let handle = self.group_handle(&group_id).await?;
        let (reply, rx) = oneshot::channel();
        self.send_cmd(
            &handle,
            GroupCmd::Join {
                request,
                client_id,
                client_host,
                reply,
            },
            rx,
            &group_id,
        )
        .await
    }

    pub async fn sync_group(&self, request: SyncGroupRequest) -> Result<SyncGroupResponse> {
        let group_id = request.group_id.clone();
        let handle = self.group_handle(&group_id).await?;
        let (reply, rx) = oneshot::channel();
        self.send_cmd(&handle, GroupCmd::Sync { request, reply }, rx, &group_id)
            .await
    }

    pub async fn heartbeat(
        &self,
        group_id: &str,
        generation_id: i32,
        member_id: &str,
    ) -> Result<ErrorCode> {
        let handle = self.group_handle(group_id).await?;
        let (reply, rx) = oneshot::channel();
        self.send_cmd(
            &handle,
            GroupCmd::Heartbeat {
                generation_id,
                member_id: member_id.to_string(),
                reply,
            },
            rx,
            group_id,
        )
        .await
    }

    pub async fn leave_group(&self, group_id: &str, member_id: &str) -> Result<ErrorCode> {
        let handle = self.group_handle(group_id).await?;
        let (reply, rx) = oneshot::channel();
        self.send_cmd(
            &handle,
            GroupCmd::Leave {
                member_id: member_id.to_string(),
                reply,
            },
            rx,
            group_id,
        )
        .await
    }

    /// Commits offsets for a group, persisting them through the offsets
    /// partition. Returns the error applied to every partition entry.
    pub async fn commit_offsets(
        &self,
        group_id: &str,
        generation_id: i32,
        member_id: &str,
        entries: Vec<(TopicPartition, OffsetAndMetadata)>,
    ) -> Result<ErrorCode> {
        self.check_coordinator(group_id)?;
        let tp = self.offsets_partition(group_id);
        self.ensure_replayed(tp.partition).await?;

        // Generation checks only apply to coordinated (non-simple) usage.
        if generation_id >= 0 || !member_id.is_empty() {
            let handle = self.group_handle(group_id).await?;
            let (reply, rx) = oneshot::channel();
            let code = self
                .send_cmd(
                    &handle,
                    GroupCmd::ValidateCommit {
                        generation_id,
                        member_id: member_id.to_string(),
                        reply,
                    },
                    rx,
                    group_id,
                )
                .await?;
            if code != ErrorCode::None {
                return Ok(code);
            }
        }

        let records: Vec<protocol::Record> = entries
            .iter()
            .map(|(tp, value)| encode_offset_commit(group_id, tp, Some(value)))
            .collect();
        let batch =
            RecordBatch::build(chrono::Utc::now().timestamp_millis(), -1, -1, -1, records).encode();
        self.replication.append_as_leader(&tp, batch).await?;

        for (tp, value) in entries {
            self.store.commit(group_id, tp, value);
        }
        Ok(ErrorCode::None)
    }

    /// Serves committed offsets from memory.
    pub fn fetch_offsets(
        &self,
        group_id: &str,
        filter: Option<&[TopicPartition]>,
    ) -> Vec<(TopicPartition, Option<OffsetAndMetadata>)> {
        match filter {
            None => self
                .store
                .fetch_all(group_id)
                .into_iter()
                .map(|(tp, v)| (tp, Some(v)))
                .collect(),
            Some(wanted) => wanted
                .iter()
                .map(|tp| (tp.clone(), self.store.fetch(group_id, tp)))
                .collect(),
        }
    }

    pub async fn fetch_offsets_checked(
        &self,
        group_id: &str,
        filter: Option<&[TopicPartition]>,
    ) -> Result<Vec<(TopicPartition, Option<OffsetAndMetadata>)>> {
        self.check_coordinator(group_id)?;
        self.ensure_replayed(self.offsets_partition(group_id).partition)
            .await?;
        Ok(self.fetch_offsets(group_id, filter))
    }

    pub async fn describe_group(&self, group_id: &str) -> Result<DescribedGroup> {
        let handle = self.group_handle(group_id).await?;
        let (reply, rx) = oneshot::channel();
        self.send_cmd(&handle, GroupCmd::Describe { reply }, rx, group_id)
            .await
    }

    pub fn list_groups(&self) -> Vec<ListedGroup> {
        self.groups
            .lock()
            .keys()
            .map(|group_id| ListedGroup {
                group_id: group_id.clone(),
                protocol_type: "consumer".to_string(),
            })
            .collect()
    }

}

/// Serialized state machine for one group.
struct GroupTask {
    group_id: String,
    ctx: GroupCtx,
    state: GroupState,
    protocol_type: String,
    protocol_name: Option<String>,
    generation: i32,
    leader: Option<String>,
    members: HashMap<String, Member>,
    join_counter: u64,
    rebalance_deadline: Option<Instant>,
    empty_since: Option<Instant>,
}

impl GroupTask {
    fn new(group_id: String, ctx: GroupCtx) -> Self {
        Self {
            group_id,
            ctx,
            state: GroupState::Empty,
            protocol_type: String::new(),
            protocol_name: None,
            generation: 0,
            leader: None,
            members: HashMap::new(),
            join_counter: 0,
            rebalance_deadline: None,
            empty_since: Some(Instant::now()),
        }
    }

    /// Seeds generation and protocol type from a recovered skeleton so a
    /// coordinator move fences stale generations. Members must re-join.
    fn restore(&mut self, recovered: GroupMetadataValue) {
        self.generation = recovered.generation_id;
        self.protocol_type = recovered.protocol_type;
        self.protocol_name = recovered.protocol_name;
    }

    async fn run(&mut self, mut rx: mpsc::Receiver<GroupCmd>) {
        debug!(group = %self.group_id, "Group task started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                GroupCmd::Join {
                    request,
                    client_id,
                    client_host,
                    reply,
                } => self.on_join(request, client_id, client_host, reply).await,
                GroupCmd::Sync { request, reply } => self.on_sync(request, reply).await,
                GroupCmd::Heartbeat {
                    generation_id,
                    member_id,
                    reply,
                } => {
                    let _ = reply.send(self.on_heartbeat(generation_id, &member_id));
                }
                GroupCmd::Leave { member_id, reply } => {
                    let code = self.on_leave(&member_id).await;
                    let _ = reply.send(code);
                }
                GroupCmd::ValidateCommit {
                    generation_id,
                    member_id,
                    reply,
                } => {
                    let _ = reply.send(self.validate_commit(generation_id, &member_id));
                }
                GroupCmd::Describe { reply } => {
                    let _ = reply.send(self.describe());
                }
                GroupCmd::Tick => self.on_tick().await,
            }
            if self.state == GroupState::Dead {
                break;
            }
        }
        debug!(group = %self.group_id, "Group task stopped");
    }

    // ---- join ----

    async fn on_join(
        &mut self,
        request: JoinGroupRequest,
        client_id: String,
        client_host: String,
        reply: oneshot::Sender<JoinGroupResponse>,
    ) {
        let member_id = request.member_id.clone();
        if request.session_timeout_ms < self.ctx.config.min_session_timeout_ms
            || request.session_timeout_ms > self.ctx.config.max_session_timeout_ms
        {
            let _ = reply.send(JoinGroupResponse::error(
                ErrorCode::InvalidSessionTimeout.code(),
                member_id,
            ));
            return;
        }
        if !self.members.is_empty() && self.protocol_type != request.protocol_type {
            let _ = reply.send(JoinGroupResponse::error(
                ErrorCode::InconsistentGroupProtocol.code(),
                member_id,
            ));
            return;
        }
        // A named member we do not know was expired: force a fresh join.
        if !member_id.is_empty() && !self.members.contains_key(&member_id) {
            let _ = reply.send(JoinGroupResponse::error(
                ErrorCode::UnknownMemberId.code(),
                member_id,
            ));
            return;
        }
        // The joining member must share a protocol with everyone present.
        let compatible = self.members.values().all(|m| {
            request.protocols.iter().any(|p| m.supports(&p.name))
        });
        if !compatible {
            let _ = reply.send(JoinGroupResponse::error(
                ErrorCode::InconsistentGroupProtocol.code(),
                member_id,
            ));
            return;
        }

        if self.members.is_empty() {
            self.protocol_type = request.protocol_type.clone();
        }
        let member_id = if member_id.is_empty() {
            format!("{}-{}", client_id, uuid::Uuid::new_v4())
        } else {
            member_id
        };

        self.join_counter += 1;
        let join_seq = self.join_counter;
        let member = self
            .members
            .entry(member_id.clone())
            .or_insert_with(|| Member {
                id: member_id.clone(),
                client_id,
                client_host,
                session_timeout_ms: request.session_timeout_ms,
                rebalance_timeout_ms: request.rebalance_timeout_ms,
                protocols: Vec::new(),
                assignment: Bytes::new(),
                last_heartbeat: Instant::now(),
                join_seq,
                rejoined: false,
                pending_join: None,
                pending_sync: None,
            });
        member.session_timeout_ms = request.session_timeout_ms;
        member.rebalance_timeout_ms = request.rebalance_timeout_ms;
        member.protocols = request.protocols;
        member.last_heartbeat = Instant::now();
        member.rejoined = true;
        // A second join from the same member supersedes the parked one.
        if let Some(stale) = member.pending_join.replace(reply) {
            let _ = stale.send(JoinGroupResponse::error(
                ErrorCode::UnknownMemberId.code(),
                member_id.clone(),
            ));
        }
        self.empty_since = None;

        match self.state {
            GroupState::Empty | GroupState::Stable | GroupState::CompletingRebalance => {
                self.prepare_rebalance("member joined").await;
            }
            GroupState::PreparingRebalance => {
                if self.all_rejoined() {
                    self.complete_join_phase().await;
                }
            }
            GroupState::Dead => {}
        }
    }

    async fn prepare_rebalance(&mut self, reason: &str) {
        if self.state != GroupState::PreparingRebalance {
            info!(group = %self.group_id, reason, "Preparing rebalance");
            telemetry::metrics().rebalances_started.inc();
        }
        let was_empty = self.state == GroupState::Empty;
        self.state = GroupState::PreparingRebalance;
        for member in self.members.values_mut() {
            // Members must re-join; anyone parked in sync is kicked back.
            if let Some(pending) = member.pending_sync.take() {
                let _ = pending.send(SyncGroupResponse::error(
                    ErrorCode::RebalanceInProgress.code(),
                ));
            }
        }
        let timeout = if was_empty {
            Duration::from_millis(self.ctx.config.initial_rebalance_delay_ms)
        } else {
            let max_ms = self
                .members
                .values()
                .map(|m| m.rebalance_timeout_ms.max(0) as u64)
                .max()
                .unwrap_or(0);
            Duration::from_millis(max_ms)
        };
        self.rebalance_deadline = Some(Instant::now() + timeout);
        if self.all_rejoined() && !was_empty {
            self.complete_join_phase().await;
        }
    }

    fn all_rejoined(&self) -> bool {
        !self.members.is_empty() && self.members.values().all(|m| m.rejoined)
    }

    /// Closes the join window: drops members that never re-joined, bumps
    /// the generation, selects protocol and leader, and answers every
    /// parked join.
    async fn complete_join_phase(&mut self) {
        self.members.retain(|_, m| m.rejoined);
        if self.members.is_empty() {
            self.transition_empty();
            return;
        }

        let Some(protocol) = self.select_protocol() else {
            // No protocol every member supports: fail the joins.
            for member in self.members.values_mut() {
                if let Some(reply) = member.pending_join.take() {
                    let _ = reply.send(JoinGroupResponse::error(
                        ErrorCode::InconsistentGroupProtocol.code(),
                        member.id.clone(),
                    ));
                }
            }
            self.members.clear();
            self.transition_empty();
            return;
        };

        self.generation += 1;
        self.protocol_name = Some(protocol.clone());
        self.state = GroupState::CompletingRebalance;
        self.rebalance_deadline = None;

        // Leader: the earliest joiner still present.
        let leader_id = self
            .members
            .values()
            .min_by_key(|m| m.join_seq)
            .map(|m| m.id.clone())
            .expect("non-empty members");
        self.leader = Some(leader_id.clone());

        let roster: Vec<JoinGroupMember> = {
            let mut members: Vec<&Member> = self.members.values().collect();
            members.sort_by_key(|m| m.join_seq);
            members
                .iter()
                .map(|m| JoinGroupMember {
                    member_id: m.id.clone(),
                    metadata: m.metadata_for(&protocol),
                })
                .collect()
        };

        info!(
            group = %self.group_id,
            generation = self.generation,
            members = self.members.len(),
            leader = %leader_id,
            protocol = %protocol,
            "Rebalance join phase complete"
        );

        for member in self.members.values_mut() {
            member.rejoined = false;
            member.last_heartbeat = Instant::now();
            if let Some(reply) = member.pending_join.take() {
                let is_leader = member.id == leader_id;
                let _ = reply.send(JoinGroupResponse {
                    throttle_time_ms: 0,
                    error_code: ErrorCode::None.code(),
                    generation_id: self.generation,
                    protocol_name: protocol.clone(),
                    leader: leader_id.clone(),
                    member_id: member.id.clone(),
                    members: if is_leader { roster.clone() } else { Vec::new() },
                });
            }
        }
    }

    /// The protocol supported by every member, preferring the leader's
    /// ordering.
    fn select_protocol(&self) -> Option<String> {
        let first = self.members.values().min_by_key(|m| m.join_seq)?;
        first
            .protocols
            .iter()
            .map(|p| p.name.clone())
            .find(|name| self.members.values().all(|m| m.supports(name)))
    }

    // ---- sync ----

    async fn on_sync(&mut self, request: SyncGroupRequest, reply: oneshot::Sender<SyncGroupResponse>) {
        let Some(member) = self.members.get_mut(&request.member_id) else {
            let _ = reply.send(SyncGroupResponse::error(ErrorCode::UnknownMemberId.code()));
            return;
        };
        if request.generation_id != self.generation {
            let _ = reply.send(SyncGroupResponse::error(ErrorCode::IllegalGeneration.code()));
            return;
        }
        match self.state {
            GroupState::PreparingRebalance => {
                let _ = reply.send(SyncGroupResponse::error(
                    ErrorCode::RebalanceInProgress.code(),
                ));
            }
            GroupState::Stable => {
                let _ = reply.send(SyncGroupResponse {
                    throttle_time_ms: 0,
                    error_code: ErrorCode::None.code(),
                    assignment: member.assignment.clone(),
                });
            }
            GroupState::CompletingRebalance => {
                member.last_heartbeat = Instant::now();
                member.pending_sync = Some(reply);
                let is_leader = self.leader.as_deref() == Some(request.member_id.as_str());
                if is_leader {
                    self.apply_assignments(request.assignments).await;
                }
            }
            GroupState::Empty | GroupState::Dead => {
                let _ = reply.send(SyncGroupResponse::error(
                    ErrorCode::UnknownMemberId.code(),
                ));
            }
        }
    }

    /// Leader delivered assignments: distribute, persist, go Stable.
    async fn apply_assignments(&mut self, assignments: Vec<protocol::messages::SyncGroupAssignment>) {
        let assigned: HashMap<String, Bytes> = assignments
            .into_iter()
            .map(|a| (a.member_id, a.assignment))
            .collect();
        for member in self.members.values_mut() {
            member.assignment = assigned.get(&member.id).cloned().unwrap_or_default();
        }
        self.state = GroupState::Stable;
        telemetry::metrics().rebalances_completed.inc();
        info!(
            group = %self.group_id,
            generation = self.generation,
            "Group is stable"
        );

        self.persist_metadata().await;

        for member in self.members.values_mut() {
            if let Some(reply) = member.pending_sync.take() {
                let _ = reply.send(SyncGroupResponse {
                    throttle_time_ms: 0,
                    error_code: ErrorCode::None.code(),
                    assignment: member.assignment.clone(),
                });
            }
        }
    }

    /// Appends the group skeleton to the offsets partition so a failover
    /// coordinator can fence stale generations.
    async fn persist_metadata(&self) {
        let value = GroupMetadataValue {
            protocol_type: self.protocol_type.clone(),
            generation_id: self.generation,
            protocol_name: self.protocol_name.clone(),
            leader: self.leader.clone(),
            members: self
                .members
                .values()
                .map(|m| GroupMetadataMember {
                    member_id: m.id.clone(),
                    client_id: m.client_id.clone(),
                    client_host: m.client_host.clone(),
                    session_timeout_ms: m.session_timeout_ms,
                    rebalance_timeout_ms: m.rebalance_timeout_ms,
                    subscription: self
                        .protocol_name
                        .as_deref()
                        .map(|p| m.metadata_for(p))
                        .unwrap_or_default(),
                    assignment: m.assignment.clone(),
                })
                .collect(),
        };
        let record = encode_group_metadata(&self.group_id, Some(&value));
        let batch = RecordBatch::build(
            chrono::Utc::now().timestamp_millis(),
            -1,
            -1,
            -1,
            vec![record],
        )
        .encode();
        if let Err(err) = self
            .ctx
            .replication
            .append_as_leader(&self.ctx.offsets_tp, batch)
            .await
        {
            warn!(group = %self.group_id, error = %err, "Failed to persist group metadata");
        }
    }

    // ---- heartbeat / leave / commit ----

    fn on_heartbeat(&mut self, generation_id: i32, member_id: &str) -> ErrorCode {
        let Some(member) = self.members.get_mut(member_id) else {
            return ErrorCode::UnknownMemberId;
        };
        member.last_heartbeat = Instant::now();
        if generation_id != self.generation {
            return ErrorCode::IllegalGeneration;
        }
        match self.state {
            GroupState::PreparingRebalance => ErrorCode::RebalanceInProgress,
            GroupState::Stable | GroupState::CompletingRebalance => ErrorCode::None,
            GroupState::Empty | GroupState::Dead => ErrorCode::UnknownMemberId,
        }
    }

    async fn on_leave(&mut self, member_id: &str) -> ErrorCode {
        let Some(mut member) = self.members.remove(member_id) else {
            return ErrorCode::UnknownMemberId;
        };
        debug!(group = %self.group_id, member = %member_id, "Member left");
        if let Some(reply) = member.pending_join.take() {
            let _ = reply.send(JoinGroupResponse::error(
                ErrorCode::UnknownMemberId.code(),
                member_id.to_string(),
            ));
        }
        if let Some(reply) = member.pending_sync.take() {
            let _ = reply.send(SyncGroupResponse::error(ErrorCode::UnknownMemberId.code()));
        }
        if self.members.is_empty() {
            self.transition_empty();
        } else {
            self.prepare_rebalance("member left").await;
        }
        ErrorCode::None
    }

    fn validate_commit(&mut self, generation_id: i32, member_id: &str) -> ErrorCode {
        if self.state == GroupState::PreparingRebalance {
            return ErrorCode::RebalanceInProgress;
        }
        if !member_id.is_empty() && !self.members.contains_key(member_id) {
            return ErrorCode::UnknownMemberId;
        }
        if generation_id >= 0 && generation_id != self.generation {
            return ErrorCode::IllegalGeneration;
        }
        ErrorCode::None
    }

    // ---- liveness ----

    async fn on_tick(&mut self) {
        let now = Instant::now();

        // Session expiry: a member whose heartbeat lapsed is gone from the
        // current generation.
        let expired: Vec<String> = self
            .members
            .values()
            .filter(|m| {
                now.duration_since(m.last_heartbeat)
                    >= Duration::from_millis(m.session_timeout_ms.max(0) as u64)
            })
            .map(|m| m.id.clone())
            .collect();
        for member_id in expired {
            warn!(group = %self.group_id, member = %member_id, "Member session expired");
            self.on_leave(&member_id).await;
        }

        // Rebalance window closes with whoever joined; members that never
        // re-joined are dropped by the completion.
        if self.state == GroupState::PreparingRebalance {
            if let Some(deadline) = self.rebalance_deadline {
                if now >= deadline {
                    self.complete_join_phase().await;
                }
            }
        }

        // Reap long-empty groups with no committed offsets.
        if self.state == GroupState::Empty {
            if let Some(since) = self.empty_since {
                if now.duration_since(since) >= DEAD_GROUP_GRACE
                    && self.ctx.store.fetch_all(&self.group_id).is_empty()
                {
                    info!(group = %self.group_id, "Reaping dead group");
                    self.state = GroupState::Dead;
                }
            }
        }
    }

    fn transition_empty(&mut self) {
        self.state = GroupState::Empty;
        self.leader = None;
        self.protocol_name = None;
        self.rebalance_deadline = None;
        self.empty_since = Some(Instant::now());
    }

    fn describe(&self) -> DescribedGroup {
        DescribedGroup {
            error_code: ErrorCode::None.code(),
            group_id: self.group_id.clone(),
            group_state: self.state.name().to_string(),
            protocol_type: self.protocol_type.clone(),
            protocol_data: self.protocol_name.clone().unwrap_or_default(),
            members: self
                .members
                .values()
                .map(|m| DescribedGroupMember {
                    member_id: m.id.clone(),
                    client_id: m.client_id.clone(),
                    client_host: m.client_host.clone(),
                    member_metadata: self
                        .protocol_name
                        .as_deref()
                        .map(|p| m.metadata_for(p))
                        .unwrap_or_default(),
                    member_assignment: m.assignment.clone(),
                })
                .collect(),
        }
    }
}
