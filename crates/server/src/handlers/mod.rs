//! Per-API request handlers. Each implements one Kafka API against the
//! partition logs, the coordinators, and the control plane, returning
//! per-partition error codes wherever the API allows partial success.

pub mod admin;
pub mod fetch;
pub mod group;
pub mod list_offsets;
pub mod metadata;
pub mod offsets;
pub mod produce;
pub mod sasl;
pub mod txn;
