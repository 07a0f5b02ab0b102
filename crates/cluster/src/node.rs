//! The consensus node task and its public handle.
//!
//! One Raft-style group per cluster holds the control-plane state. The
//! node is a single task consuming an inbox of peer RPCs, local
//! proposals, and timer ticks; everything it decides is persisted through
//! [`crate::raft_log`] before it answers anyone.
//!
//! Pre-vote is always on: a partitioned node probes with its prospective
//! term before disrupting a healthy leader. Defaults: heartbeat 1s,
//! election timeout randomized in [3s, 6s).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use broker_core::{BrokerConfig, TopicPartition};
use storage::TopicManager;

use crate::command::{ApplyData, Command, MetadataEvent};
use crate::error::{ClusterError, Result};
use crate::raft_log::{save_stable, LogEntry, RaftLog, Snapshot, StableState};
use crate::state::MetadataState;
use crate::transport::{self, InboundRpc, RaftMessage, RaftTransport, TcpTransport};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

enum Replier {
    Local(oneshot::Sender<Result<ApplyData>>),
    Remote(oneshot::Sender<RaftMessage>),
}

impl Replier {
    fn resolve(self, result: std::result::Result<ApplyData, String>, leader: Option<i32>) {
        match self {
            Replier::Local(tx) => {
                let _ = tx.send(result.map_err(ClusterError::Rejected));
            }
            Replier::Remote(tx) => {
                let _ = tx.send(RaftMessage::ProposeResponse { result, leader });
            }
        }
    }
}

enum NodeMsg {
    Rpc(InboundRpc),
    PeerReply(RaftMessage),
    Propose {
        command: Command,
        reply: oneshot::Sender<Result<ApplyData>>,
    },
    Tick,
    Shutdown,
}

/// Cloneable handle to the consensus node.
#[derive(Clone)]
pub struct ClusterHandle {
    broker_id: i32,
    peers: Arc<HashMap<i32, String>>,
    tx: mpsc::Sender<NodeMsg>,
    state: Arc<RwLock<MetadataState>>,
    events_tx: broadcast::Sender<MetadataEvent>,
    leader_hint: Arc<AtomicI32>,
    commit_timeout: Duration,
}

impl ClusterHandle {
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    /// Latest known consensus leader, which doubles as the controller and
    /// transaction coordinator.
    pub fn controller_id(&self) -> Option<i32> {
        let id = self.leader_hint.load(Ordering::Relaxed);
        (id >= 0).then_some(id)
    }

    pub fn is_controller(&self) -> bool {
        self.controller_id() == Some(self.broker_id)
    }

    /// Runs `f` against the current metadata view.
    pub fn read<R>(&self, f: impl FnOnce(&MetadataState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn metadata(&self) -> MetadataState {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetadataEvent> {
        self.events_tx.subscribe()
    }

    /// Stops the consensus node: no more heartbeats, votes, or proposals.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(NodeMsg::Shutdown).await;
    }

    /// Proposes a command, forwarding to the leader when this node is a
    /// follower. Resolves once the command is applied (or rejected).
    pub async fn propose(&self, command: Command) -> Result<ApplyData> {
        tokio::time::timeout(self.commit_timeout, self.propose_inner(command))
            .await
            .map_err(|_| ClusterError::CommitTimeout)?
    }

    async fn propose_inner(&self, command: Command) -> Result<ApplyData> {
        match self.propose_local(command.clone()).await {
            Err(ClusterError::NotController {
                leader: Some(leader),
            }) if leader != self.broker_id => self.forward(leader, command).await,
            other => other,
        }
    }

    async fn propose_local(&self, command: Command) -> Result<ApplyData> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMsg::Propose { command, reply })
            .await
            .map_err(|_| ClusterError::ShuttingDown)?;
        rx.await.map_err(|_| ClusterError::ShuttingDown)?
    }

    async fn forward(&self, leader: i32, command: Command) -> Result<ApplyData> {
        let addr = self
            .peers
            .get(&leader)
            .ok_or(ClusterError::NotController { leader: None })?;
        match TcpTransport
            .send(leader, addr, RaftMessage::Propose { command })
            .await?
        {
            RaftMessage::ProposeResponse { result, .. } => {
                result.map_err(ClusterError::Rejected)
            }
            _ => Err(ClusterError::Corrupt("unexpected forward response".into())),
        }
    }
}

/// Bootstraps the consensus node: storage, transport, timers.
pub struct Cluster;

impl Cluster {
    pub async fn start(
        config: &BrokerConfig,
        topics: Arc<TopicManager>,
    ) -> Result<ClusterHandle> {
        let broker_id = config.broker_id;
        let mut peers: HashMap<i32, String> = config
            .parse_peers()
            .map_err(|e| ClusterError::Rejected(e.to_string()))?
            .into_iter()
            .collect();
        let self_addr = peers.remove(&broker_id);

        let raft_dir = config.data_dir.join("raft");
        let (log, stable, snapshot) = RaftLog::open(&raft_dir).await?;

        let mut state = MetadataState::new();
        let mut last_applied = 0;
        let mut snapshot_last_term = 0;
        if let Some(snapshot) = snapshot {
            last_applied = snapshot.last_index;
            snapshot_last_term = snapshot.last_term;
            state = snapshot.state;
        }

        let shared_state = Arc::new(RwLock::new(state.clone()));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let leader_hint = Arc::new(AtomicI32::new(-1));
        let (tx, rx) = mpsc::channel(1024);

        // Serve peer RPCs when clustered.
        if let Some(addr) = self_addr.as_deref() {
            if !peers.is_empty() {
                let listener = TcpListener::bind(addr).await?;
                info!(addr = %addr, "Consensus transport listening");
                let rpc_tx = tx.clone();
                let (rpc_in, mut rpc_out) = mpsc::channel::<InboundRpc>(256);
                tokio::spawn(transport::serve(listener, rpc_in));
                tokio::spawn(async move {
                    while let Some(rpc) = rpc_out.recv().await {
                        if rpc_tx.send(NodeMsg::Rpc(rpc)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }

        let mut node = Node {
            id: broker_id,
            peers: peers.clone(),
            unclean_leader_election: config.replication.unclean_leader_election,
            role: Role::Follower,
            stable,
            log,
            raft_dir,
            commit_index: last_applied,
            last_applied,
            snapshot_last_term,
            leader_id: None,
            pre_votes: HashSet::new(),
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            peer_last_seen: HashMap::new(),
            election_deadline: Instant::now(),
            last_leader_contact: Instant::now(),
            last_heartbeat: Instant::now(),
            last_controller_check: Instant::now(),
            state,
            shared_state: shared_state.clone(),
            events_tx: events_tx.clone(),
            leader_hint: leader_hint.clone(),
            topics,
            pending: HashMap::new(),
            transport: Arc::new(TcpTransport),
            heartbeat_interval: Duration::from_millis(config.raft.heartbeat_ms),
            election_timeout: Duration::from_millis(config.raft.election_ms),
            snapshot_threshold: config.raft.snapshot_threshold,
            inbox_tx: tx.clone(),
        };
        node.reset_election_deadline();
        node.rehydrate_local().await;

        tokio::spawn(async move { node.run(rx).await });

        let tick_tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tick_tx.send(NodeMsg::Tick).await.is_err() {
                    break;
                }
            }
        });

        let handle = ClusterHandle {
            broker_id,
            peers: Arc::new(peers),
            tx,
            state: shared_state,
            events_tx,
            leader_hint,
            commit_timeout: Duration::from_millis(config.raft.commit_timeout_ms),
        };

        // Advertise this broker's client listener through the state machine.
        let register = handle.clone();
        let (host, port) = config
            .advertised_addr()
            .map_err(|e| ClusterError::Rejected(e.to_string()))?;
        tokio::spawn(async move {
            loop {
                match register
                    .propose(Command::RegisterBroker {
                        broker_id,
                        host: host.clone(),
                        port,
                    })
                    .await
                {
                    Ok(_) => {
                        info!(broker_id, "Registered broker in cluster metadata");
                        break;
                    }
                    Err(err) => {
                        debug!(error = %err, "Broker registration retry");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(handle)
    }
}

struct Node {
    id: i32,
    peers: HashMap<i32, String>,
    unclean_leader_election: bool,
    role: Role,
    stable: StableState,
    log: RaftLog,
    raft_dir: PathBuf,
    commit_index: u64,
    last_applied: u64,
    snapshot_last_term: u64,
    leader_id: Option<i32>,
    pre_votes: HashSet<i32>,
    votes: HashSet<i32>,
    next_index: HashMap<i32, u64>,
    match_index: HashMap<i32, u64>,
    peer_last_seen: HashMap<i32, Instant>,
    election_deadline: Instant,
    last_leader_contact: Instant,
    last_heartbeat: Instant,
    last_controller_check: Instant,
    state: MetadataState,
    shared_state: Arc<RwLock<MetadataState>>,
    events_tx: broadcast::Sender<MetadataEvent>,
    leader_hint: Arc<AtomicI32>,
    topics: Arc<TopicManager>,
    pending: HashMap<u64, Replier>,
    transport: Arc<dyn RaftTransport>,
    heartbeat_interval: Duration,
    election_timeout: Duration,
    snapshot_threshold: u64,
    inbox_tx: mpsc::Sender<NodeMsg>,
}

impl Node {
    async fn run(mut self, mut rx: mpsc::Receiver<NodeMsg>) {
        info!(id = self.id, peers = self.peers.len(), "Consensus node started");
        telemetry::health().consensus.set_healthy();
        while let Some(msg) = rx.recv().await {
            match msg {
                NodeMsg::Tick => self.on_tick().await,
                NodeMsg::Propose { command, reply } => {
                    self.on_propose(command, Replier::Local(reply)).await;
                }
                NodeMsg::Rpc(rpc) => self.on_rpc(rpc).await,
                NodeMsg::PeerReply(message) => self.on_peer_reply(message).await,
                NodeMsg::Shutdown => break,
            }
        }
        info!(id = self.id, "Consensus node stopped");
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn reset_election_deadline(&mut self) {
        let base = self.election_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..base);
        self.election_deadline = Instant::now() + Duration::from_millis(base + jitter);
    }

    async fn persist_stable(&mut self) {
        if let Err(err) = save_stable(&self.raft_dir, &self.stable).await {
            error!(error = %err, "Failed to persist consensus stable state");
        }
    }

    fn set_leader(&mut self, leader: Option<i32>) {
        self.leader_id = leader;
        self.leader_hint.store(leader.unwrap_or(-1), Ordering::Relaxed);
    }

    async fn step_down(&mut self, term: u64) {
        if term > self.stable.current_term {
            self.stable.current_term = term;
            self.stable.voted_for = None;
            self.persist_stable().await;
        }
        if self.role == Role::Leader {
            info!(id = self.id, term, "Stepping down from consensus leadership");
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.pre_votes.clear();
        self.reset_election_deadline();
    }

    // ---- elections ----

    async fn on_tick(&mut self) {
        let now = Instant::now();
        match self.role {
            Role::Leader => {
                if now.duration_since(self.last_heartbeat) >= self.heartbeat_interval {
                    self.broadcast_append_entries().await;
                }
                if now >= self.last_controller_check + Duration::from_secs(1) {
                    self.last_controller_check = now;
                    self.controller_duties().await;
                }
            }
            _ => {
                if now >= self.election_deadline {
                    self.start_pre_vote().await;
                }
            }
        }
    }

    async fn start_pre_vote(&mut self) {
        if self.peers.is_empty() {
            // Single node: no one to disrupt.
            self.start_election().await;
            return;
        }
        debug!(id = self.id, term = self.stable.current_term, "Starting pre-vote");
        self.role = Role::PreCandidate;
        self.pre_votes = HashSet::from([self.id]);
        self.reset_election_deadline();
        let message = RaftMessage::RequestVote {
            term: self.stable.current_term + 1,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            pre_vote: true,
        };
        self.broadcast(message);
    }

    async fn start_election(&mut self) {
        self.stable.current_term += 1;
        self.stable.voted_for = Some(self.id);
        self.persist_stable().await;
        self.role = Role::Candidate;
        self.votes = HashSet::from([self.id]);
        self.reset_election_deadline();
        debug!(id = self.id, term = self.stable.current_term, "Starting election");

        if self.votes.len() >= self.quorum() {
            self.become_leader().await;
            return;
        }
        let message = RaftMessage::RequestVote {
            term: self.stable.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            pre_vote: false,
        };
        self.broadcast(message);
    }

    async fn become_leader(&mut self) {
        info!(id = self.id, term = self.stable.current_term, "Won consensus election");
        telemetry::metrics().leader_elections.inc();
        self.role = Role::Leader;
        self.set_leader(Some(self.id));
        // Hold off failure detection until a round of heartbeat responses
        // has refreshed peer liveness.
        self.last_controller_check = Instant::now() + self.election_timeout;
        let next = self.log.last_index() + 1;
        let peer_ids: Vec<i32> = self.peers.keys().copied().collect();
        for peer in peer_ids {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        // Committing an entry of the new term commits everything before it.
        self.append_local(Command::Noop, None).await;
    }

    fn log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index())
    }

    // ---- proposals ----

    async fn on_propose(&mut self, command: Command, replier: Replier) {
        if self.role != Role::Leader {
            let leader = self.leader_id.filter(|&l| l != self.id);
            match replier {
                Replier::Local(tx) => {
                    let _ = tx.send(Err(ClusterError::NotController { leader }));
                }
                Replier::Remote(tx) => {
                    let _ = tx.send(RaftMessage::ProposeResponse {
                        result: Err("not the controller".into()),
                        leader,
                    });
                }
            }
            return;
        }
        self.append_local(command, Some(replier)).await;
    }

    async fn append_local(&mut self, command: Command, replier: Option<Replier>) {
        let index = self.log.last_index() + 1;
        let entry = LogEntry {
            term: self.stable.current_term,
            index,
            command,
        };
        if let Err(err) = self.log.append(std::slice::from_ref(&entry)).await {
            error!(error = %err, "Failed to append to consensus log");
            if let Some(replier) = replier {
                replier.resolve(Err("log append failed".into()), None);
            }
            return;
        }
        if let Some(replier) = replier {
            self.pending.insert(index, replier);
        }
        if self.peers.is_empty() {
            self.commit_index = index;
            self.apply_committed().await;
        } else {
            self.broadcast_append_entries().await;
        }
    }

    // ---- replication ----

    async fn broadcast_append_entries(&mut self) {
        self.last_heartbeat = Instant::now();
        let peer_ids: Vec<i32> = self.peers.keys().copied().collect();
        for peer in peer_ids {
            self.send_append_entries(peer);
        }
        // A lone leader advances commit on its own.
        if self.peers.is_empty() {
            self.advance_commit().await;
        }
    }

    fn send_append_entries(&mut self, peer: i32) {
        let next = *self.next_index.get(&peer).unwrap_or(&1);
        let message = if next < self.log.first_index() {
            RaftMessage::InstallSnapshot {
                term: self.stable.current_term,
                leader_id: self.id,
                snapshot: Snapshot {
                    last_index: self.last_applied,
                    last_term: self
                        .log
                        .term_at(self.last_applied)
                        .unwrap_or(self.snapshot_last_term),
                    state: self.state.clone(),
                },
            }
        } else {
            let prev_log_index = next - 1;
            let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
            RaftMessage::AppendEntries {
                term: self.stable.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries: self.log.entries_from(next),
                leader_commit: self.commit_index,
            }
        };
        self.send_to_peer(peer, message);
    }

    fn send_to_peer(&self, peer: i32, message: RaftMessage) {
        let Some(addr) = self.peers.get(&peer).cloned() else {
            return;
        };
        let transport = self.transport.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            match transport.send(peer, &addr, message).await {
                Ok(reply) => {
                    let _ = inbox.send(NodeMsg::PeerReply(reply)).await;
                }
                Err(err) => {
                    debug!(peer, error = %err, "Consensus RPC failed");
                }
            }
        });
    }

    fn broadcast(&self, message: RaftMessage) {
        for &peer in self.peers.keys() {
            self.send_to_peer(peer, message.clone());
        }
    }

    // ---- inbound RPCs ----

    async fn on_rpc(&mut self, rpc: InboundRpc) {
        let InboundRpc { message, reply } = rpc;
        match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
                pre_vote,
            } => {
                let response = self
                    .handle_request_vote(term, candidate_id, last_log_index, last_log_term, pre_vote)
                    .await;
                let _ = reply.send(response);
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let response = self
                    .handle_append_entries(
                        term,
                        leader_id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit,
                    )
                    .await;
                let _ = reply.send(response);
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                snapshot,
            } => {
                let response = self.handle_install_snapshot(term, leader_id, snapshot).await;
                let _ = reply.send(response);
            }
            RaftMessage::Propose { command } => {
                self.on_propose(command, Replier::Remote(reply)).await;
            }
            other => {
                debug!(?other, "Unexpected RPC payload");
            }
        }
    }

    async fn handle_request_vote(
        &mut self,
        term: u64,
        candidate_id: i32,
        last_log_index: u64,
        last_log_term: u64,
        pre_vote: bool,
    ) -> RaftMessage {
        if pre_vote {
            // Granting a pre-vote mutates nothing; refuse while a live
            // leader is still heartbeating.
            let leader_fresh = self.last_leader_contact.elapsed() < self.election_timeout;
            let granted = term > self.stable.current_term
                && self.log_up_to_date(last_log_term, last_log_index)
                && !leader_fresh;
            return RaftMessage::RequestVoteResponse {
                term: self.stable.current_term,
                from: self.id,
                vote_granted: granted,
                pre_vote: true,
            };
        }

        if term > self.stable.current_term {
            self.step_down(term).await;
        }
        let can_vote = match self.stable.voted_for {
            None => true,
            Some(id) => id == candidate_id,
        };
        let granted = term == self.stable.current_term
            && can_vote
            && self.log_up_to_date(last_log_term, last_log_index);
        if granted {
            self.stable.voted_for = Some(candidate_id);
            self.persist_stable().await;
            self.reset_election_deadline();
        }
        RaftMessage::RequestVoteResponse {
            term: self.stable.current_term,
            from: self.id,
            vote_granted: granted,
            pre_vote: false,
        }
    }

    async fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: i32,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> RaftMessage {
        if term < self.stable.current_term {
            return RaftMessage::AppendEntriesResponse {
                term: self.stable.current_term,
                from: self.id,
                success: false,
                match_index: self.log.last_index(),
            };
        }
        if term > self.stable.current_term || self.role != Role::Follower {
            self.step_down(term).await;
        }
        self.set_leader(Some(leader_id));
        self.last_leader_contact = Instant::now();
        self.reset_election_deadline();

        if self.log.term_at(prev_log_index) != Some(prev_log_term) {
            return RaftMessage::AppendEntriesResponse {
                term: self.stable.current_term,
                from: self.id,
                success: false,
                match_index: self.log.last_index().min(prev_log_index.saturating_sub(1)),
            };
        }

        let mut to_append = Vec::new();
        for entry in entries {
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    if let Err(err) = self.log.truncate_from(entry.index).await {
                        error!(error = %err, "Consensus log truncation failed");
                    }
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        if !to_append.is_empty() {
            if let Err(err) = self.log.append(&to_append).await {
                error!(error = %err, "Consensus log append failed");
                return RaftMessage::AppendEntriesResponse {
                    term: self.stable.current_term,
                    from: self.id,
                    success: false,
                    match_index: self.log.last_index(),
                };
            }
        }

        let match_index = self.log.last_index();
        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(match_index);
            self.apply_committed().await;
        }
        RaftMessage::AppendEntriesResponse {
            term: self.stable.current_term,
            from: self.id,
            success: true,
            match_index,
        }
    }

    async fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader_id: i32,
        snapshot: Snapshot,
    ) -> RaftMessage {
        if term < self.stable.current_term {
            return RaftMessage::InstallSnapshotResponse {
                term: self.stable.current_term,
                from: self.id,
            };
        }
        if term > self.stable.current_term || self.role != Role::Follower {
            self.step_down(term).await;
        }
        self.set_leader(Some(leader_id));
        self.last_leader_contact = Instant::now();
        self.reset_election_deadline();

        info!(last_index = snapshot.last_index, "Installing consensus snapshot");
        if let Err(err) = self.log.truncate_from(self.log.first_index()).await {
            error!(error = %err, "Failed clearing log for snapshot");
        }
        self.state = snapshot.state.clone();
        self.commit_index = snapshot.last_index;
        self.last_applied = snapshot.last_index;
        self.snapshot_last_term = snapshot.last_term;
        if let Err(err) = self.log.compact_to(&snapshot).await {
            error!(error = %err, "Failed persisting installed snapshot");
        }
        *self.shared_state.write() = self.state.clone();
        self.rehydrate_local().await;

        RaftMessage::InstallSnapshotResponse {
            term: self.stable.current_term,
            from: self.id,
        }
    }

    async fn on_peer_reply(&mut self, message: RaftMessage) {
        match message {
            RaftMessage::RequestVoteResponse {
                term,
                from,
                vote_granted,
                pre_vote,
            } => {
                if term > self.stable.current_term {
                    self.step_down(term).await;
                    return;
                }
                self.peer_last_seen.insert(from, Instant::now());
                if pre_vote {
                    if self.role == Role::PreCandidate && vote_granted {
                        self.pre_votes.insert(from);
                        if self.pre_votes.len() >= self.quorum() {
                            self.start_election().await;
                        }
                    }
                } else if self.role == Role::Candidate
                    && term == self.stable.current_term
                    && vote_granted
                {
                    self.votes.insert(from);
                    if self.votes.len() >= self.quorum() {
                        self.become_leader().await;
                    }
                }
            }
            RaftMessage::AppendEntriesResponse {
                term,
                from,
                success,
                match_index,
            } => {
                if term > self.stable.current_term {
                    self.step_down(term).await;
                    return;
                }
                if self.role != Role::Leader {
                    return;
                }
                self.peer_last_seen.insert(from, Instant::now());
                if success {
                    let entry = self.match_index.entry(from).or_insert(0);
                    *entry = (*entry).max(match_index);
                    self.next_index.insert(from, match_index + 1);
                    self.advance_commit().await;
                } else {
                    let next = self
                        .next_index
                        .get(&from)
                        .copied()
                        .unwrap_or(1)
                        .saturating_sub(1)
                        .min(match_index + 1)
                        .max(1);
                    self.next_index.insert(from, next);
                    self.send_append_entries(from);
                }
            }
            RaftMessage::InstallSnapshotResponse { term, from } => {
                if term > self.stable.current_term {
                    self.step_down(term).await;
                    return;
                }
                self.peer_last_seen.insert(from, Instant::now());
                self.next_index.insert(from, self.log.first_index());
                self.match_index.insert(from, self.last_applied);
            }
            other => {
                debug!(?other, "Unexpected peer reply");
            }
        }
    }

    async fn advance_commit(&mut self) {
        let mut candidate = self.log.last_index();
        while candidate > self.commit_index {
            if self.log.term_at(candidate) == Some(self.stable.current_term) {
                let replicated = 1 + self
                    .match_index
                    .values()
                    .filter(|&&m| m >= candidate)
                    .count();
                if replicated >= self.quorum() {
                    self.commit_index = candidate;
                    break;
                }
            }
            candidate -= 1;
        }
        self.apply_committed().await;
    }

    // ---- state machine ----

    async fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                warn!(index, "Committed entry missing from log");
                break;
            };
            let outcome = self.state.apply(&entry.command);
            self.sync_local(&entry.command).await;
            *self.shared_state.write() = self.state.clone();
            for event in &outcome.events {
                let _ = self.events_tx.send(event.clone());
            }
            if let Some(replier) = self.pending.remove(&index) {
                replier.resolve(outcome.result, Some(self.id));
            }
            self.last_applied = index;
        }
        self.maybe_snapshot().await;
    }

    /// Applies a command's storage side effects on this broker.
    /// Idempotent: replays after restart are harmless.
    async fn sync_local(&mut self, command: &Command) {
        match command {
            Command::CreateTopic {
                name,
                partition_count,
                replication_factor,
                config,
                assignments,
            } => {
                let local: Vec<i32> = assignments
                    .iter()
                    .enumerate()
                    .filter(|(_, replicas)| replicas.contains(&self.id))
                    .map(|(i, _)| i as i32)
                    .collect();
                if local.is_empty() {
                    return;
                }
                if let Err(err) = self
                    .topics
                    .ensure_topic(name, *partition_count, *replication_factor, config.clone(), local)
                    .await
                {
                    error!(topic = %name, error = %err, "Failed to materialize topic");
                }
            }
            Command::DeleteTopic { name } => {
                if self.topics.get_topic(name).await.is_some() {
                    if let Err(err) = self.topics.delete_topic(name).await {
                        error!(topic = %name, error = %err, "Failed to delete topic");
                    }
                }
            }
            Command::AlterTopicConfig { name, overrides } => {
                if self.topics.get_topic(name).await.is_some() {
                    if let Err(err) = self.topics.alter_topic_config(name, overrides).await {
                        error!(topic = %name, error = %err, "Failed to alter topic config");
                    }
                }
            }
            Command::UpdateIsr {
                topic,
                partition,
                leader_epoch,
                ..
            } => {
                let tp = TopicPartition::new(topic.clone(), *partition);
                if let Ok(handle) = self.topics.partition(&tp).await {
                    let _ = handle.set_leader_epoch(*leader_epoch).await;
                }
            }
            _ => {}
        }
    }

    /// Reopens local partitions implied by the current state (after boot
    /// or snapshot install).
    async fn rehydrate_local(&mut self) {
        let topics: Vec<_> = self.state.topics.values().cloned().collect();
        for topic in topics {
            let assignments: Vec<Vec<i32>> =
                topic.partitions.iter().map(|p| p.replicas.clone()).collect();
            self.sync_local(&Command::CreateTopic {
                name: topic.name.clone(),
                partition_count: topic.partition_count,
                replication_factor: topic.replication_factor,
                config: topic.config.clone(),
                assignments,
            })
            .await;
        }
        for event in self.state.leadership_events() {
            let _ = self.events_tx.send(event);
        }
    }

    async fn maybe_snapshot(&mut self) {
        let applied_entries = self.last_applied.saturating_sub(self.log.first_index() - 1);
        if applied_entries < self.snapshot_threshold {
            return;
        }
        let snapshot = Snapshot {
            last_index: self.last_applied,
            last_term: self
                .log
                .term_at(self.last_applied)
                .unwrap_or(self.snapshot_last_term),
            state: self.state.clone(),
        };
        info!(last_index = snapshot.last_index, "Writing consensus snapshot");
        self.snapshot_last_term = snapshot.last_term;
        if let Err(err) = self.log.compact_to(&snapshot).await {
            error!(error = %err, "Consensus snapshot failed");
        }
    }

    // ---- controller duties ----

    /// Re-elects partition leaders hosted on dead brokers. Runs on the
    /// consensus leader only.
    async fn controller_duties(&mut self) {
        let alive = self.alive_brokers();
        let mut commands = Vec::new();
        for topic in self.state.topics.values() {
            for (i, p) in topic.partitions.iter().enumerate() {
                if alive.contains(&p.leader) {
                    continue;
                }
                let new_leader = p
                    .isr
                    .iter()
                    .find(|b| alive.contains(b))
                    .copied()
                    .or_else(|| {
                        if self.unclean_leader_election {
                            p.replicas.iter().find(|b| alive.contains(b)).copied()
                        } else {
                            None
                        }
                    });
                let Some(new_leader) = new_leader else {
                    warn!(
                        topic = %topic.name,
                        partition = i,
                        "No electable replica alive"
                    );
                    continue;
                };
                let isr: Vec<i32> = p
                    .isr
                    .iter()
                    .filter(|b| alive.contains(b))
                    .copied()
                    .collect();
                let isr = if isr.is_empty() { vec![new_leader] } else { isr };
                info!(
                    topic = %topic.name,
                    partition = i,
                    old_leader = p.leader,
                    new_leader,
                    "Electing new partition leader"
                );
                commands.push(Command::UpdateIsr {
                    topic: topic.name.clone(),
                    partition: i as i32,
                    leader: new_leader,
                    leader_epoch: p.leader_epoch + 1,
                    isr,
                });
            }
        }
        for command in commands {
            self.append_local(command, None).await;
        }
    }

    fn alive_brokers(&self) -> HashSet<i32> {
        let mut alive = HashSet::from([self.id]);
        let cutoff = self.election_timeout;
        for (&peer, &seen) in &self.peer_last_seen {
            if seen.elapsed() < cutoff {
                alive.insert(peer);
            }
        }
        alive
    }
}
