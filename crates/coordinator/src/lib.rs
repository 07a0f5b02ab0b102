//! Coordination layer: consumer groups (membership, rebalance, offsets)
//! and transactions (two-phase commit markers).
//!
//! Each group is hosted by the broker leading its `__consumer_offsets`
//! partition; transactions are hosted by the cluster controller. Both
//! persist through replicated logs: offsets and group metadata as records
//! of the internal topic, transaction state through the control plane.

pub mod error;
pub mod group;
pub mod offsets;
pub mod txn;

pub use error::{CoordinatorError, Result};
pub use group::GroupCoordinator;
pub use offsets::{offsets_partition_for, OffsetAndMetadata, OffsetStore};
pub use txn::TransactionCoordinator;
