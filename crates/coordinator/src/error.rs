//! Coordinator error types.

use broker_core::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("not the coordinator for {0}")]
    NotCoordinator(String),

    #[error("coordinator not available: {0}")]
    NotAvailable(String),

    #[error("unknown member {0}")]
    UnknownMember(String),

    #[error("illegal generation {got}, current {current}")]
    IllegalGeneration { current: i32, got: i32 },

    #[error("rebalance in progress for {0}")]
    RebalanceInProgress(String),

    #[error("invalid session timeout {0}")]
    InvalidSessionTimeout(i32),

    #[error("inconsistent group protocol for {0}")]
    InconsistentProtocol(String),

    #[error("invalid group id {0:?}")]
    InvalidGroupId(String),

    #[error("unknown producer id {0}")]
    UnknownProducerId(i64),

    #[error("invalid producer id mapping for {0}")]
    InvalidProducerIdMapping(String),

    #[error("producer fenced: epoch {got} < {current}")]
    ProducerFenced { current: i16, got: i16 },

    #[error("invalid transaction state: {0}")]
    InvalidTxnState(String),

    #[error("concurrent transactions for {0}")]
    ConcurrentTransactions(String),

    #[error("invalid transaction timeout {0}")]
    InvalidTransactionTimeout(i32),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),

    #[error("codec error: {0}")]
    Codec(#[from] protocol::ProtocolError),
}

impl CoordinatorError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotCoordinator(_) => ErrorCode::NotCoordinator,
            Self::NotAvailable(_) => ErrorCode::CoordinatorNotAvailable,
            Self::UnknownMember(_) => ErrorCode::UnknownMemberId,
            Self::IllegalGeneration { .. } => ErrorCode::IllegalGeneration,
            Self::RebalanceInProgress(_) => ErrorCode::RebalanceInProgress,
            Self::InvalidSessionTimeout(_) => ErrorCode::InvalidSessionTimeout,
            Self::InconsistentProtocol(_) => ErrorCode::InconsistentGroupProtocol,
            Self::InvalidGroupId(_) => ErrorCode::InvalidGroupId,
            Self::UnknownProducerId(_) => ErrorCode::UnknownProducerId,
            Self::InvalidProducerIdMapping(_) => ErrorCode::InvalidProducerIdMapping,
            Self::ProducerFenced { .. } => ErrorCode::ProducerFenced,
            Self::InvalidTxnState(_) => ErrorCode::InvalidTxnState,
            Self::ConcurrentTransactions(_) => ErrorCode::ConcurrentTransactions,
            Self::InvalidTransactionTimeout(_) => ErrorCode::InvalidTransactionTimeout,
            Self::Timeout(_) => ErrorCode::RequestTimedOut,
            Self::Storage(err) => err.error_code(),
            Self::Cluster(err) => err.error_code(),
            Self::Codec(_) => ErrorCode::InvalidRequest,
        }
    }
}
