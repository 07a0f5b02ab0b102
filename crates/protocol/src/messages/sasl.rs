//! SaslHandshake (key 17) and SaslAuthenticate (key 36).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

#[derive(Debug, Clone)]
pub struct SaslHandshakeRequest {
    pub mechanism: String,
}

impl SaslHandshakeRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            mechanism: buf.read_string("mechanism")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_string(&self.mechanism);
    }
}

#[derive(Debug, Clone)]
pub struct SaslHandshakeResponse {
    pub error_code: i16,
    pub mechanisms: Vec<String>,
}

impl SaslHandshakeResponse {
    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_i16(self.error_code);
        buf.put_array(&self.mechanisms, |b, m| b.put_string(m));
    }

    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            error_code: buf.read_i16("error_code")?,
            mechanisms: buf.read_array("mechanisms", |b| b.read_string("mechanism"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SaslAuthenticateRequest {
    pub auth_bytes: Bytes,
}

impl SaslAuthenticateRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            auth_bytes: buf.read_bytes("auth_bytes")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_bytes_block(&self.auth_bytes);
    }
}

#[derive(Debug, Clone)]
pub struct SaslAuthenticateResponse {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub auth_bytes: Bytes,
    pub session_lifetime_ms: i64,
}

impl SaslAuthenticateResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_i16(self.error_code);
        buf.put_nullable_string(self.error_message.as_deref());
        buf.put_bytes_block(&self.auth_bytes);
        if version >= 1 {
            buf.put_i64(self.session_lifetime_ms);
        }
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        Ok(Self {
            error_code: buf.read_i16("error_code")?,
            error_message: buf.read_nullable_string("error_message")?,
            auth_bytes: buf.read_bytes("auth_bytes")?,
            session_lifetime_ms: if version >= 1 {
                buf.read_i64("session_lifetime_ms")?
            } else {
                0
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sasl_round_trip() {
        let handshake = SaslHandshakeResponse {
            error_code: 0,
            mechanisms: vec!["PLAIN".into()],
        };
        let mut buf = BytesMut::new();
        handshake.encode(&mut buf, 1);
        let mut b = buf.freeze();
        let decoded = SaslHandshakeResponse::decode(&mut b, 1).unwrap();
        assert_eq!(decoded.mechanisms, vec!["PLAIN"]);

        let auth = SaslAuthenticateRequest {
            auth_bytes: Bytes::from_static(b"\0user\0pass"),
        };
        let mut buf = BytesMut::new();
        auth.encode(&mut buf, 0);
        let mut b = buf.freeze();
        let decoded = SaslAuthenticateRequest::decode(&mut b, 0).unwrap();
        assert_eq!(&decoded.auth_bytes[..], b"\0user\0pass");
    }
}
