//! Request and response headers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};
use crate::ApiKey;

/// Request header v1: api key, api version, correlation id, client id.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            api_key: buf.read_i16("api_key")?,
            api_version: buf.read_i16("api_version")?,
            correlation_id: buf.read_i32("correlation_id")?,
            client_id: buf.read_nullable_string("client_id")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16(self.api_key);
        buf.put_i16(self.api_version);
        buf.put_i32(self.correlation_id);
        buf.put_nullable_string(self.client_id.as_deref());
    }

    /// The parsed api key, if this broker knows it.
    pub fn api(&self) -> Result<ApiKey> {
        ApiKey::from_i16(self.api_key)
    }
}

/// Response header v0: just the correlation id.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub correlation_id: i32,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.correlation_id);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            correlation_id: buf.read_i32("correlation_id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = RequestHeader {
            api_key: ApiKey::Metadata.code(),
            api_version: 4,
            correlation_id: 7,
            client_id: Some("console-producer".into()),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut b = buf.freeze();
        let decoded = RequestHeader::decode(&mut b).unwrap();
        assert_eq!(decoded.api_key, ApiKey::Metadata.code());
        assert_eq!(decoded.api_version, 4);
        assert_eq!(decoded.correlation_id, 7);
        assert_eq!(decoded.client_id.as_deref(), Some("console-producer"));
        assert_eq!(decoded.api().unwrap(), ApiKey::Metadata);
    }
}
