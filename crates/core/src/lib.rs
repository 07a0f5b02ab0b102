//! Core types, configuration, and the error taxonomy shared by every
//! broker crate.

pub mod config;
pub mod error;
pub mod limits;
pub mod types;

pub use config::*;
pub use error::{BrokerError, ErrorCode, Result};
pub use types::*;
