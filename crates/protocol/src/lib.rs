//! Kafka binary protocol codec.
//!
//! Framing is a 4-byte big-endian length prefix followed by the message.
//! Requests carry a v1 header (api key, api version, correlation id,
//! nullable client id); responses a v0 header (correlation id). Per-API
//! message types live under [`messages`], each encoding/decoding a declared
//! `[min, max]` version range; record batches are the v2 on-disk and
//! on-wire format with a Castagnoli CRC.

pub mod api_key;
pub mod error;
pub mod header;
pub mod messages;
pub mod records;
pub mod wire;

pub use api_key::ApiKey;
pub use error::{ProtocolError, Result};
pub use header::{RequestHeader, ResponseHeader};
pub use records::{BatchHeader, ControlMarker, Record, RecordBatch, RecordHeader};
