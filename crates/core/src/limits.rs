//! Protocol and storage limits.
//!
//! These bound per-request memory and keep a single misbehaving client from
//! exhausting the broker. Constants used on the request path:
//! `MAX_FRAME_BYTES`, `MAX_TOPIC_NAME_LEN`; the rest are defaults that the
//! configuration can override per topic.

/// Maximum size of a single request frame (length prefix value).
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Maximum size of one record batch accepted from a producer (1MB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Maximum topic name length, per the Kafka naming rules.
pub const MAX_TOPIC_NAME_LEN: usize = 249;

/// Number of recent (sequence, offset) batches remembered per producer for
/// duplicate detection.
pub const PRODUCER_SEQUENCE_WINDOW: usize = 5;

/// Sparse offset-index entry width: relative offset u32 + position u32.
pub const OFFSET_INDEX_ENTRY_BYTES: usize = 8;

/// Sparse time-index entry width: timestamp i64 + relative offset u32.
pub const TIME_INDEX_ENTRY_BYTES: usize = 12;

/// Partitions of the internal `__consumer_offsets` topic.
pub const DEFAULT_OFFSETS_TOPIC_PARTITIONS: i32 = 50;
