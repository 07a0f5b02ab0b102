//! Integration test harness: an in-process broker on a loopback listener
//! plus a minimal wire client speaking the real protocol.

pub mod client;
pub mod fixtures;
pub mod setup;
