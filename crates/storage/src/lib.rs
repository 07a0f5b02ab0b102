//! Partitioned append-only log storage.
//!
//! One partition is a directory of segments (`.log` + sparse `.index` /
//! `.timeindex` files named by base offset) orchestrated by a single writer
//! task per partition. Readers never go through that task: segment
//! metadata is published through atomics and short read-locked lookups, so
//! fetches run concurrently with appends.

pub mod compaction;
pub mod error;
pub mod index;
pub mod log;
pub mod partition;
pub mod producer_state;
pub mod segment;
pub mod topics;

pub use error::{Result, StorageError};
pub use log::{AppendOutcome, FetchSlice, PartitionLog, PartitionShared, ReadCeiling, RecoveryReport};
pub use partition::{PartitionCommand, PartitionHandle};
pub use producer_state::{AbortedTxn, ProducerStateManager, SequenceOutcome};
pub use topics::{Topic, TopicManager};
