//! Internal telemetry for the broker.
//!
//! Counters and health flags live in-process behind [`metrics()`] and
//! [`health()`]; exporting them is a concern for external observers, not
//! the core.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
