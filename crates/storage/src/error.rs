//! Storage error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] protocol::ProtocolError),

    #[error("offset {offset} out of range [{start}, {end}]")]
    OffsetOutOfRange { offset: i64, start: i64, end: i64 },

    #[error("follower append at {got} diverges from log end offset {expected}")]
    Divergent { expected: i64, got: i64 },

    #[error("batch of {0} bytes exceeds max.message.bytes")]
    MessageTooLarge(usize),

    #[error("producer epoch {got} is older than current epoch {current}")]
    FencedEpoch { current: i16, got: i16 },

    #[error("out of order sequence: expected {expected}, got {got}")]
    OutOfOrderSequence { expected: i32, got: i32 },

    #[error("corrupt segment {segment}: {reason}")]
    Corrupt { segment: String, reason: String },

    #[error("unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),

    #[error("topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("partition is offline: {0}")]
    Offline(String),

    #[error("invalid record batch: {0}")]
    InvalidBatch(String),
}

impl StorageError {
    pub fn corrupt(segment: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    /// The per-partition error code this failure maps to on the wire.
    pub fn error_code(&self) -> broker_core::ErrorCode {
        use broker_core::ErrorCode;
        match self {
            Self::OffsetOutOfRange { .. } | Self::Divergent { .. } => ErrorCode::OffsetOutOfRange,
            Self::MessageTooLarge(_) => ErrorCode::MessageTooLarge,
            Self::FencedEpoch { .. } => ErrorCode::InvalidProducerEpoch,
            Self::OutOfOrderSequence { .. } => ErrorCode::OutOfOrderSequenceNumber,
            Self::Corrupt { .. } | Self::Codec(_) => ErrorCode::CorruptMessage,
            Self::UnknownTopicOrPartition(_) => ErrorCode::UnknownTopicOrPartition,
            Self::TopicAlreadyExists(_) => ErrorCode::TopicAlreadyExists,
            Self::InvalidTopic(_) => ErrorCode::InvalidTopic,
            Self::InvalidBatch(_) => ErrorCode::InvalidRecord,
            Self::Io(_) | Self::Offline(_) => ErrorCode::KafkaStorageError,
        }
    }
}

impl From<StorageError> for broker_core::BrokerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => broker_core::BrokerError::Storage(e),
            StorageError::UnknownTopicOrPartition(t) => {
                broker_core::BrokerError::UnknownTopicOrPartition(t)
            }
            StorageError::TopicAlreadyExists(t) => broker_core::BrokerError::TopicAlreadyExists(t),
            StorageError::InvalidTopic(t) => broker_core::BrokerError::InvalidTopic(t),
            other => broker_core::BrokerError::internal(other.to_string()),
        }
    }
}
