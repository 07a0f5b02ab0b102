//! Unified error types for the broker.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Kafka protocol error codes.
///
/// Only the codes this broker can actually produce are listed. The numeric
/// values are fixed by the Kafka protocol and go on the wire as `i16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ErrorCode {
    UnknownServerError = -1,
    None = 0,
    OffsetOutOfRange = 1,
    CorruptMessage = 2,
    UnknownTopicOrPartition = 3,
    LeaderNotAvailable = 5,
    NotLeaderForPartition = 6,
    RequestTimedOut = 7,
    MessageTooLarge = 10,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    InvalidTopic = 17,
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,
    InvalidRequiredAcks = 21,
    IllegalGeneration = 22,
    InconsistentGroupProtocol = 23,
    InvalidGroupId = 24,
    UnknownMemberId = 25,
    InvalidSessionTimeout = 26,
    RebalanceInProgress = 27,
    UnsupportedSaslMechanism = 33,
    IllegalSaslState = 34,
    UnsupportedVersion = 35,
    TopicAlreadyExists = 36,
    InvalidPartitions = 37,
    InvalidReplicationFactor = 38,
    InvalidConfig = 40,
    NotController = 41,
    InvalidRequest = 42,
    UnsupportedForMessageFormat = 43,
    OutOfOrderSequenceNumber = 45,
    DuplicateSequenceNumber = 46,
    InvalidProducerEpoch = 47,
    InvalidTxnState = 48,
    InvalidProducerIdMapping = 49,
    InvalidTransactionTimeout = 50,
    ConcurrentTransactions = 51,
    TransactionCoordinatorFenced = 52,
    KafkaStorageError = 56,
    SaslAuthenticationFailed = 58,
    UnknownProducerId = 59,
    InvalidRecord = 87,
    ProducerFenced = 90,
}

impl ErrorCode {
    /// Wire representation.
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Whether a client is expected to retry after this error.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::NotLeaderForPartition
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::RequestTimedOut
                | ErrorCode::CoordinatorNotAvailable
                | ErrorCode::NotCoordinator
                | ErrorCode::RebalanceInProgress
                | ErrorCode::NotEnoughReplicas
                | ErrorCode::NotEnoughReplicasAfterAppend
                | ErrorCode::ConcurrentTransactions
        )
    }
}

/// Unified error type for the broker.
///
/// Each variant carries enough context for logging; `error_code()` gives the
/// per-partition (or top-level) code that goes in a response.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),

    #[error("not leader for partition: {0}")]
    NotLeader(String),

    #[error("leader not available: {0}")]
    LeaderNotAvailable(String),

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("invalid partition count: {0}")]
    InvalidPartitions(String),

    #[error("invalid replication factor: {0}")]
    InvalidReplicationFactor(String),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("corrupt message: {0}")]
    CorruptMessage(String),

    #[error("request timed out: {0}")]
    RequestTimedOut(String),

    #[error("not enough replicas: {0}")]
    NotEnoughReplicas(String),

    #[error("invalid producer epoch: {0}")]
    InvalidProducerEpoch(String),

    #[error("producer fenced: {0}")]
    ProducerFenced(String),

    #[error("unknown producer id: {0}")]
    UnknownProducerId(i64),

    #[error("out of order sequence: {0}")]
    OutOfOrderSequence(String),

    #[error("duplicate sequence")]
    DuplicateSequence,

    #[error("invalid transaction state: {0}")]
    InvalidTxnState(String),

    #[error("invalid producer id mapping: {0}")]
    InvalidProducerIdMapping(String),

    #[error("concurrent transactions: {0}")]
    ConcurrentTransactions(String),

    #[error("transaction coordinator fenced: {0}")]
    TransactionCoordinatorFenced(String),

    #[error("coordinator not available: {0}")]
    CoordinatorNotAvailable(String),

    #[error("not coordinator for: {0}")]
    NotCoordinator(String),

    #[error("unknown member id: {0}")]
    UnknownMemberId(String),

    #[error("illegal generation: {0}")]
    IllegalGeneration(String),

    #[error("rebalance in progress: {0}")]
    RebalanceInProgress(String),

    #[error("invalid session timeout: {0}")]
    InvalidSessionTimeout(String),

    #[error("inconsistent group protocol: {0}")]
    InconsistentGroupProtocol(String),

    #[error("invalid group id: {0}")]
    InvalidGroupId(String),

    #[error("unsupported version: api {api_key} version {version}")]
    UnsupportedVersion { api_key: i16, version: i16 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("not controller")]
    NotController,

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn unknown_topic(msg: impl Into<String>) -> Self {
        Self::UnknownTopicOrPartition(msg.into())
    }

    pub fn not_leader(msg: impl Into<String>) -> Self {
        Self::NotLeader(msg.into())
    }

    pub fn invalid_topic(msg: impl Into<String>) -> Self {
        Self::InvalidTopic(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptMessage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Maps this error to its wire error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownTopicOrPartition(_) => ErrorCode::UnknownTopicOrPartition,
            Self::NotLeader(_) => ErrorCode::NotLeaderForPartition,
            Self::LeaderNotAvailable(_) => ErrorCode::LeaderNotAvailable,
            Self::OffsetOutOfRange(_) => ErrorCode::OffsetOutOfRange,
            Self::InvalidTopic(_) => ErrorCode::InvalidTopic,
            Self::TopicAlreadyExists(_) => ErrorCode::TopicAlreadyExists,
            Self::InvalidPartitions(_) => ErrorCode::InvalidPartitions,
            Self::InvalidReplicationFactor(_) => ErrorCode::InvalidReplicationFactor,
            Self::MessageTooLarge(_) => ErrorCode::MessageTooLarge,
            Self::CorruptMessage(_) => ErrorCode::CorruptMessage,
            Self::RequestTimedOut(_) => ErrorCode::RequestTimedOut,
            Self::NotEnoughReplicas(_) => ErrorCode::NotEnoughReplicas,
            Self::InvalidProducerEpoch(_) => ErrorCode::InvalidProducerEpoch,
            Self::ProducerFenced(_) => ErrorCode::ProducerFenced,
            Self::UnknownProducerId(_) => ErrorCode::UnknownProducerId,
            Self::OutOfOrderSequence(_) => ErrorCode::OutOfOrderSequenceNumber,
            Self::DuplicateSequence => ErrorCode::DuplicateSequenceNumber,
            Self::InvalidTxnState(_) => ErrorCode::InvalidTxnState,
            Self::InvalidProducerIdMapping(_) => ErrorCode::InvalidProducerIdMapping,
            Self::ConcurrentTransactions(_) => ErrorCode::ConcurrentTransactions,
            Self::TransactionCoordinatorFenced(_) => ErrorCode::TransactionCoordinatorFenced,
            Self::CoordinatorNotAvailable(_) => ErrorCode::CoordinatorNotAvailable,
            Self::NotCoordinator(_) => ErrorCode::NotCoordinator,
            Self::UnknownMemberId(_) => ErrorCode::UnknownMemberId,
            Self::IllegalGeneration(_) => ErrorCode::IllegalGeneration,
            Self::RebalanceInProgress(_) => ErrorCode::RebalanceInProgress,
            Self::InvalidSessionTimeout(_) => ErrorCode::InvalidSessionTimeout,
            Self::InconsistentGroupProtocol(_) => ErrorCode::InconsistentGroupProtocol,
            Self::InvalidGroupId(_) => ErrorCode::InvalidGroupId,
            Self::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Self::NotController => ErrorCode::NotController,
            Self::InvalidRecord(_) => ErrorCode::InvalidRecord,
            Self::Storage(_) => ErrorCode::KafkaStorageError,
            Self::Internal(_) => ErrorCode::UnknownServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::None.code(), 0);
        assert_eq!(ErrorCode::OffsetOutOfRange.code(), 1);
        assert_eq!(ErrorCode::UnknownTopicOrPartition.code(), 3);
        assert_eq!(ErrorCode::NotLeaderForPartition.code(), 6);
        assert_eq!(ErrorCode::UnsupportedVersion.code(), 35);
        assert_eq!(ErrorCode::DuplicateSequenceNumber.code(), 46);
        assert_eq!(ErrorCode::ProducerFenced.code(), 90);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorCode::NotLeaderForPartition.is_retryable());
        assert!(ErrorCode::RebalanceInProgress.is_retryable());
        assert!(!ErrorCode::UnknownTopicOrPartition.is_retryable());
        assert!(!ErrorCode::InvalidProducerEpoch.is_retryable());
    }

    #[test]
    fn test_error_maps_to_code() {
        let err = BrokerError::not_leader("orders-0");
        assert_eq!(err.error_code(), ErrorCode::NotLeaderForPartition);
        let err = BrokerError::DuplicateSequence;
        assert_eq!(err.error_code(), ErrorCode::DuplicateSequenceNumber);
    }
}
