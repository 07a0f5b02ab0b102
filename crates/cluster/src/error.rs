//! Cluster error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] protocol::ProtocolError),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("not the controller; leader is {leader:?}")]
    NotController { leader: Option<i32> },

    #[error("proposal timed out")]
    CommitTimeout,

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("peer {0} unreachable: {1}")]
    PeerUnreachable(i32, String),

    #[error("remote error code {0}")]
    RemoteError(i16),

    #[error("consensus state corrupt: {0}")]
    Corrupt(String),

    #[error("node is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    pub fn error_code(&self) -> broker_core::ErrorCode {
        use broker_core::ErrorCode;
        match self {
            Self::NotController { .. } => ErrorCode::NotController,
            Self::CommitTimeout => ErrorCode::RequestTimedOut,
            Self::Rejected(_) => ErrorCode::InvalidRequest,
            Self::RemoteError(_) | Self::PeerUnreachable(..) => ErrorCode::LeaderNotAvailable,
            _ => ErrorCode::UnknownServerError,
        }
    }
}
