//! Consensus transport: length-prefixed JSON messages over TCP.
//!
//! Each RPC is request/response on the same connection; peers keep the
//! connection open and pipeline subsequent RPCs over it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::command::{ApplyData, Command};
use crate::error::{ClusterError, Result};
use crate::raft_log::{LogEntry, Snapshot};

const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: i32,
        last_log_index: u64,
        last_log_term: u64,
        pre_vote: bool,
    },
    RequestVoteResponse {
        term: u64,
        from: i32,
        vote_granted: bool,
        pre_vote: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: i32,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        from: i32,
        success: bool,
        match_index: u64,
    },
    InstallSnapshot {
        term: u64,
        leader_id: i32,
        snapshot: Snapshot,
    },
    InstallSnapshotResponse {
        term: u64,
        from: i32,
    },
    /// A follower forwarding a client proposal to the leader.
    Propose {
        command: Command,
    },
    ProposeResponse {
        result: std::result::Result<ApplyData, String>,
        leader: Option<i32>,
    },
}

/// How messages reach a peer; swapped out in tests.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn send(&self, peer_id: i32, addr: &str, message: RaftMessage) -> Result<RaftMessage>;
}

/// Production transport: one TCP connection per call.
///
/// Consensus traffic is low-rate (heartbeats and small commands), so the
/// reconnect cost stays negligible next to the simplicity.
pub struct TcpTransport;

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn send(&self, peer_id: i32, addr: &str, message: RaftMessage) -> Result<RaftMessage> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClusterError::PeerUnreachable(peer_id, e.to_string()))?;
        write_message(&mut stream, &message).await?;
        read_message(&mut stream)
            .await?
            .ok_or_else(|| ClusterError::PeerUnreachable(peer_id, "connection closed".into()))
    }
}

pub async fn write_message(stream: &mut TcpStream, message: &RaftMessage) -> Result<()> {
    let json =
        serde_json::to_vec(message).map_err(|e| ClusterError::Corrupt(e.to_string()))?;
    stream.write_all(&(json.len() as u32).to_be_bytes()).await?;
    stream.write_all(&json).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_message(stream: &mut TcpStream) -> Result<Option<RaftMessage>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(ClusterError::Corrupt(format!(
            "oversized consensus message: {len} bytes"
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    let message =
        serde_json::from_slice(&buf).map_err(|e| ClusterError::Corrupt(e.to_string()))?;
    Ok(Some(message))
}

/// An inbound RPC awaiting its reply.
pub struct InboundRpc {
    pub message: RaftMessage,
    pub reply: oneshot::Sender<RaftMessage>,
}

/// Accepts peer connections and feeds their RPCs to the node task.
pub async fn serve(listener: TcpListener, inbox: mpsc::Sender<InboundRpc>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "Consensus accept failed");
                continue;
            }
        };
        debug!(peer = %peer, "Consensus peer connected");
        let inbox = inbox.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, inbox).await {
                debug!(peer = %peer, error = %err, "Consensus connection closed");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    inbox: mpsc::Sender<InboundRpc>,
) -> Result<()> {
    while let Some(message) = read_message(&mut stream).await? {
        let (reply_tx, reply_rx) = oneshot::channel();
        inbox
            .send(InboundRpc {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClusterError::ShuttingDown)?;
        let reply = reply_rx.await.map_err(|_| ClusterError::ShuttingDown)?;
        write_message(&mut stream, &reply).await?;
    }
    Ok(())
}
