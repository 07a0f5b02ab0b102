//! Wire primitives: big-endian integers, length-prefixed strings/bytes,
//! arrays, and the zigzag varints used inside record batches.
//!
//! All reads bound-check before touching the buffer; `bytes` accessors
//! panic on underflow, so nothing here calls them unguarded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::error::{ProtocolError, Result};

macro_rules! checked_get {
    ($buf:expr, $field:expr, $n:expr, $get:ident) => {{
        if $buf.remaining() < $n {
            return Err(ProtocolError::Truncated {
                field: $field,
                needed: $n - $buf.remaining(),
            });
        }
        Ok($buf.$get())
    }};
}

/// Checked read helpers over [`Bytes`].
pub trait ReadExt {
    fn read_i8(&mut self, field: &'static str) -> Result<i8>;
    fn read_i16(&mut self, field: &'static str) -> Result<i16>;
    fn read_i32(&mut self, field: &'static str) -> Result<i32>;
    fn read_i64(&mut self, field: &'static str) -> Result<i64>;
    fn read_u32(&mut self, field: &'static str) -> Result<u32>;
    fn read_bool(&mut self, field: &'static str) -> Result<bool>;
    fn read_raw(&mut self, field: &'static str, len: usize) -> Result<Bytes>;

    /// Non-null string: i16 length then UTF-8 bytes.
    fn read_string(&mut self, field: &'static str) -> Result<String>;
    /// Nullable string: length -1 encodes null.
    fn read_nullable_string(&mut self, field: &'static str) -> Result<Option<String>>;
    /// Non-null byte blob: i32 length.
    fn read_bytes(&mut self, field: &'static str) -> Result<Bytes>;
    /// Nullable byte blob: length -1 encodes null.
    fn read_nullable_bytes(&mut self, field: &'static str) -> Result<Option<Bytes>>;

    /// Non-null array: i32 count then elements.
    fn read_array<T, F>(&mut self, field: &'static str, f: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>;
    /// Nullable array: count -1 encodes null.
    fn read_nullable_array<T, F>(&mut self, field: &'static str, f: F) -> Result<Option<Vec<T>>>
    where
        F: FnMut(&mut Self) -> Result<T>;

    /// Zigzag varint (record encoding).
    fn read_varint(&mut self, field: &'static str) -> Result<i32>;
    /// Zigzag varlong (record encoding).
    fn read_varlong(&mut self, field: &'static str) -> Result<i64>;
}

impl ReadExt for Bytes {
    fn read_i8(&mut self, field: &'static str) -> Result<i8> {
        checked_get!(self, field, 1, get_i8)
    }

    fn read_i16(&mut self, field: &'static str) -> Result<i16> {
        checked_get!(self, field, 2, get_i16)
    }

    fn read_i32(&mut self, field: &'static str) -> Result<i32> {
        checked_get!(self, field, 4, get_i32)
    }

    fn read_i64(&mut self, field: &'static str) -> Result<i64> {
        checked_get!(self, field, 8, get_i64)
    }

    fn read_u32(&mut self, field: &'static str) -> Result<u32> {
        checked_get!(self, field, 4, get_u32)
    }

    fn read_bool(&mut self, field: &'static str) -> Result<bool> {
        Ok(self.read_i8(field)? != 0)
    }

    fn read_raw(&mut self, field: &'static str, len: usize) -> Result<Bytes> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                field,
                needed: len - self.remaining(),
            });
        }
        Ok(self.split_to(len))
    }

    fn read_string(&mut self, field: &'static str) -> Result<String> {
        self.read_nullable_string(field)?
            .ok_or(ProtocolError::InvalidLength { field, len: -1 })
    }

    fn read_nullable_string(&mut self, field: &'static str) -> Result<Option<String>> {
        let len = self.read_i16(field)?;
        if len < -1 {
            return Err(ProtocolError::InvalidLength {
                field,
                len: len as i64,
            });
        }
        if len == -1 {
            return Ok(None);
        }
        let raw = self.read_raw(field, len as usize)?;
        let s = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidString { field })?;
        Ok(Some(s.to_string()))
    }

    fn read_bytes(&mut self, field: &'static str) -> Result<Bytes> {
        self.read_nullable_bytes(field)?
            .ok_or(ProtocolError::InvalidLength { field, len: -1 })
    }

    fn read_nullable_bytes(&mut self, field: &'static str) -> Result<Option<Bytes>> {
        let len = self.read_i32(field)?;
        if len < -1 {
            return Err(ProtocolError::InvalidLength {
                field,
                len: len as i64,
            });
        }
        if len == -1 {
            return Ok(None);
        }
        Ok(Some(self.read_raw(field, len as usize)?))
    }

    fn read_array<T, F>(&mut self, field: &'static str, f: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        self.read_nullable_array(field, f)?
            .ok_or(ProtocolError::InvalidLength { field, len: -1 })
    }

    fn read_nullable_array<T, F>(&mut self, field: &'static str, mut f: F) -> Result<Option<Vec<T>>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let count = self.read_i32(field)?;
        if count < -1 {
            return Err(ProtocolError::InvalidLength {
                field,
                len: count as i64,
            });
        }
        if count == -1 {
            return Ok(None);
        }
        // Bound the pre-allocation by what the buffer could possibly hold.
        let mut items = Vec::with_capacity((count as usize).min(self.remaining()));
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(Some(items))
    }

    fn read_varint(&mut self, field: &'static str) -> Result<i32> {
        match i32::decode_var(self.chunk()) {
            Some((value, read)) => {
                self.advance(read);
                Ok(value)
            }
            None => Err(ProtocolError::Truncated { field, needed: 1 }),
        }
    }

    fn read_varlong(&mut self, field: &'static str) -> Result<i64> {
        match i64::decode_var(self.chunk()) {
            Some((value, read)) => {
                self.advance(read);
                Ok(value)
            }
            None => Err(ProtocolError::Truncated { field, needed: 1 }),
        }
    }
}

/// Write helpers over [`BytesMut`]. Writes are infallible; sizes are bounded
/// upstream by the frame limit.
pub trait WriteExt {
    fn put_string(&mut self, s: &str);
    fn put_nullable_string(&mut self, s: Option<&str>);
    fn put_bytes_block(&mut self, b: &[u8]);
    fn put_nullable_bytes(&mut self, b: Option<&[u8]>);
    fn put_array<T, F>(&mut self, items: &[T], f: F)
    where
        F: FnMut(&mut Self, &T);
    fn put_null_array(&mut self);
    fn put_bool(&mut self, v: bool);
    fn put_varint(&mut self, v: i32);
    fn put_varlong(&mut self, v: i64);
}

impl WriteExt for BytesMut {
    fn put_string(&mut self, s: &str) {
        self.put_i16(s.len() as i16);
        self.put_slice(s.as_bytes());
    }

    fn put_nullable_string(&mut self, s: Option<&str>) {
        match s {
            Some(s) => self.put_string(s),
            None => self.put_i16(-1),
        }
    }

    fn put_bytes_block(&mut self, b: &[u8]) {
        self.put_i32(b.len() as i32);
        self.put_slice(b);
    }

    fn put_nullable_bytes(&mut self, b: Option<&[u8]>) {
        match b {
            Some(b) => self.put_bytes_block(b),
            None => self.put_i32(-1),
        }
    }

    fn put_array<T, F>(&mut self, items: &[T], mut f: F)
    where
        F: FnMut(&mut Self, &T),
    {
        self.put_i32(items.len() as i32);
        for item in items {
            f(self, item);
        }
    }

    fn put_null_array(&mut self) {
        self.put_i32(-1);
    }

    fn put_bool(&mut self, v: bool) {
        self.put_i8(v as i8);
    }

    fn put_varint(&mut self, v: i32) {
        let mut tmp = [0u8; 5];
        let n = v.encode_var(&mut tmp);
        self.put_slice(&tmp[..n]);
    }

    fn put_varlong(&mut self, v: i64) {
        let mut tmp = [0u8; 10];
        let n = v.encode_var(&mut tmp);
        self.put_slice(&tmp[..n]);
    }
}

/// Bytes a varint/varlong will occupy once encoded.
pub fn varint_len(v: i32) -> usize {
    v.required_space()
}

pub fn varlong_len(v: i64) -> usize {
    v.required_space()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_string("orders");
        buf.put_nullable_string(None);
        let mut b = buf.freeze();
        assert_eq!(b.read_string("s").unwrap(), "orders");
        assert_eq!(b.read_nullable_string("s").unwrap(), None);
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let mut b = Bytes::from_static(&[0x00]);
        assert!(matches!(
            b.read_i32("x"),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_array_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_array(&[1i32, 2, 3], |b, v| b.put_i32(*v));
        let mut b = buf.freeze();
        let items = b.read_array("a", |b| b.read_i32("v")).unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn test_varint_zigzag_round_trip() {
        for v in [0i32, 1, -1, 150, -150, i32::MAX, i32::MIN] {
            let mut buf = BytesMut::new();
            buf.put_varint(v);
            let mut b = buf.freeze();
            assert_eq!(b.read_varint("v").unwrap(), v);
        }
        for v in [0i64, -1, 1 << 40, -(1 << 40), i64::MAX, i64::MIN] {
            let mut buf = BytesMut::new();
            buf.put_varlong(v);
            let mut b = buf.freeze();
            assert_eq!(b.read_varlong("v").unwrap(), v);
        }
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i16(-2);
        let mut b = buf.freeze();
        assert!(matches!(
            b.read_nullable_string("s"),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }
}
