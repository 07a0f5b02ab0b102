//! FindCoordinator (key 10), versions 0-1.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

/// Coordinator kinds (v1+): 0 = consumer group, 1 = transaction.
pub const COORDINATOR_TYPE_GROUP: i8 = 0;
pub const COORDINATOR_TYPE_TRANSACTION: i8 = 1;

#[derive(Debug, Clone)]
pub struct FindCoordinatorRequest {
    pub key: String,
    pub key_type: i8,
}

impl FindCoordinatorRequest {
    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        Ok(Self {
            key: buf.read_string("key")?,
            key_type: if version >= 1 {
                buf.read_i8("key_type")?
            } else {
                COORDINATOR_TYPE_GROUP
            },
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_string(&self.key);
        if version >= 1 {
            buf.put_i8(self.key_type);
        }
    }
}

#[derive(Debug, Clone)]
pub struct FindCoordinatorResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl FindCoordinatorResponse {
    pub fn error(error_code: i16) -> Self {
        Self {
            throttle_time_ms: 0,
            error_code,
            error_message: None,
            node_id: -1,
            host: String::new(),
            port: -1,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_i16(self.error_code);
        if version >= 1 {
            buf.put_nullable_string(self.error_message.as_deref());
        }
        buf.put_i32(self.node_id);
        buf.put_string(&self.host);
        buf.put_i32(self.port);
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 1 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        let error_code = buf.read_i16("error_code")?;
        let error_message = if version >= 1 {
            buf.read_nullable_string("error_message")?
        } else {
            None
        };
        Ok(Self {
            throttle_time_ms,
            error_code,
            error_message,
            node_id: buf.read_i32("node_id")?,
            host: buf.read_string("host")?,
            port: buf.read_i32("port")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_coordinator_round_trip() {
        let response = FindCoordinatorResponse {
            throttle_time_ms: 0,
            error_code: 0,
            error_message: None,
            node_id: 2,
            host: "broker-2".into(),
            port: 9092,
        };
        for version in 0..=1 {
            let mut buf = BytesMut::new();
            response.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = FindCoordinatorResponse::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.node_id, 2);
        }
    }
}
