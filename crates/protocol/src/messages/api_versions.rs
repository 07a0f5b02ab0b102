//! ApiVersions (key 18), versions 0-2.

use bytes::{BufMut, Bytes, BytesMut};

use crate::api_key::ALL_APIS;
use crate::error::Result;
use crate::wire::ReadExt;

#[derive(Debug, Clone, Default)]
pub struct ApiVersionsRequest;

impl ApiVersionsRequest {
    pub fn decode(_buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self)
    }

    pub fn encode(&self, _buf: &mut BytesMut, _version: i16) {}
}

#[derive(Debug, Clone)]
pub struct ApiVersionsRange {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

#[derive(Debug, Clone)]
pub struct ApiVersionsResponse {
    pub error_code: i16,
    pub api_keys: Vec<ApiVersionsRange>,
    pub throttle_time_ms: i32,
}

impl ApiVersionsResponse {
    /// The ranges this broker actually serves.
    pub fn supported() -> Self {
        Self {
            error_code: 0,
            api_keys: ALL_APIS
                .iter()
                .map(|api| {
                    let (min_version, max_version) = api.version_range();
                    ApiVersionsRange {
                        api_key: api.code(),
                        min_version,
                        max_version,
                    }
                })
                .collect(),
            throttle_time_ms: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_i16(self.error_code);
        buf.put_i32(self.api_keys.len() as i32);
        for range in &self.api_keys {
            buf.put_i16(range.api_key);
            buf.put_i16(range.min_version);
            buf.put_i16(range.max_version);
        }
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let error_code = buf.read_i16("error_code")?;
        let api_keys = buf.read_array("api_keys", |b| {
            Ok(ApiVersionsRange {
                api_key: b.read_i16("api_key")?,
                min_version: b.read_i16("min_version")?,
                max_version: b.read_i16("max_version")?,
            })
        })?;
        let throttle_time_ms = if version >= 1 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            error_code,
            api_keys,
            throttle_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_ranges_round_trip() {
        let response = ApiVersionsResponse::supported();
        for version in 0..=2 {
            let mut buf = BytesMut::new();
            response.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = ApiVersionsResponse::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.api_keys.len(), ALL_APIS.len());
            assert_eq!(decoded.error_code, 0);
        }
    }
}
