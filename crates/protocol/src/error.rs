//! Codec error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while decoding or validating wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message truncated: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },

    #[error("invalid length {len} for {field}")]
    InvalidLength { field: &'static str, len: i64 },

    #[error("invalid utf-8 in {field}")]
    InvalidString { field: &'static str },

    #[error("unknown api key {0}")]
    UnknownApiKey(i16),

    #[error("unsupported version {version} for api {api:?}")]
    UnsupportedVersion { api: crate::ApiKey, version: i16 },

    #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("unsupported record batch magic {0}")]
    UnsupportedMagic(i8),

    #[error("malformed record batch: {0}")]
    MalformedBatch(&'static str),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
