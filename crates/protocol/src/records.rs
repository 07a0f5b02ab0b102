//! Record batch v2 encode/decode.
//!
//! A batch is the atomic unit of append, replication, and fsync. Layout
//! (all big-endian):
//!
//! ```text
//! base_offset: i64            // assigned by the leader at append
//! batch_length: i32           // bytes after this field
//! partition_leader_epoch: i32 // stamped by the leader at append
//! magic: i8 = 2
//! crc: u32                    // Castagnoli, over attributes..end
//! attributes: i16             // compression 0-2, ts-type 3, txn 4, control 5
//! last_offset_delta: i32
//! first_timestamp: i64
//! max_timestamp: i64
//! producer_id: i64
//! producer_epoch: i16
//! base_sequence: i32
//! records_count: i32
//! records: [record]           // varint-framed entries
//! ```
//!
//! The CRC does not cover base_offset, batch_length, partition_leader_epoch,
//! magic, or itself, so the leader stamps offsets and epochs in place
//! without recomputing it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::wire::{varint_len, varlong_len, ReadExt, WriteExt};

/// Fixed header bytes before the records array.
pub const BATCH_HEADER_BYTES: usize = 61;
/// Offset of the CRC field within a batch.
pub const CRC_OFFSET: usize = 17;
/// Offset of the first CRC-covered byte (attributes).
pub const ATTRIBUTES_OFFSET: usize = 21;
/// Bytes not counted by `batch_length` (base_offset + batch_length itself).
pub const LOG_OVERHEAD: usize = 12;

pub const MAGIC_V2: i8 = 2;

const ATTR_TIMESTAMP_TYPE: i16 = 1 << 3;
const ATTR_TRANSACTIONAL: i16 = 1 << 4;
const ATTR_CONTROL: i16 = 1 << 5;
const ATTR_COMPRESSION_MASK: i16 = 0x7;

/// Parsed fixed header of a record batch; cheap to take from a raw slice
/// without touching the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub base_offset: i64,
    pub batch_length: i32,
    pub partition_leader_epoch: i32,
    pub magic: i8,
    pub crc: u32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub first_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records_count: i32,
}

impl BatchHeader {
    /// Parses the fixed header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BATCH_HEADER_BYTES {
            return Err(ProtocolError::Truncated {
                field: "batch_header",
                needed: BATCH_HEADER_BYTES - bytes.len(),
            });
        }
        let header = Self {
            base_offset: i64::from_be_bytes(bytes[0..8].try_into().unwrap()),
            batch_length: i32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            partition_leader_epoch: i32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            magic: bytes[16] as i8,
            crc: u32::from_be_bytes(bytes[17..21].try_into().unwrap()),
            attributes: i16::from_be_bytes(bytes[21..23].try_into().unwrap()),
            last_offset_delta: i32::from_be_bytes(bytes[23..27].try_into().unwrap()),
            first_timestamp: i64::from_be_bytes(bytes[27..35].try_into().unwrap()),
            max_timestamp: i64::from_be_bytes(bytes[35..43].try_into().unwrap()),
            producer_id: i64::from_be_bytes(bytes[43..51].try_into().unwrap()),
            producer_epoch: i16::from_be_bytes(bytes[51..53].try_into().unwrap()),
            base_sequence: i32::from_be_bytes(bytes[53..57].try_into().unwrap()),
            records_count: i32::from_be_bytes(bytes[57..61].try_into().unwrap()),
        };
        if header.magic != MAGIC_V2 {
            return Err(ProtocolError::UnsupportedMagic(header.magic));
        }
        if header.batch_length < (BATCH_HEADER_BYTES - LOG_OVERHEAD) as i32 {
            return Err(ProtocolError::MalformedBatch("batch_length too small"));
        }
        Ok(header)
    }

    /// Total bytes this batch occupies, including base_offset and length.
    pub fn total_len(&self) -> usize {
        LOG_OVERHEAD + self.batch_length as usize
    }

    /// Offset of the last record in the batch.
    pub fn last_offset(&self) -> i64 {
        self.base_offset + self.last_offset_delta as i64
    }

    /// One past the last offset.
    pub fn next_offset(&self) -> i64 {
        self.last_offset() + 1
    }

    pub fn is_transactional(&self) -> bool {
        self.attributes & ATTR_TRANSACTIONAL != 0
    }

    pub fn is_control(&self) -> bool {
        self.attributes & ATTR_CONTROL != 0
    }

    pub fn compression_codec(&self) -> i16 {
        self.attributes & ATTR_COMPRESSION_MASK
    }

    pub fn has_producer_id(&self) -> bool {
        self.producer_id >= 0
    }

    pub fn last_sequence(&self) -> i32 {
        if self.base_sequence < 0 {
            -1
        } else {
            // Sequences wrap at i32::MAX, matching the producer's counter.
            ((self.base_sequence as i64 + self.last_offset_delta as i64) % (i32::MAX as i64 + 1))
                as i32
        }
    }
}

/// Verifies the Castagnoli CRC of a complete raw batch.
pub fn verify_batch_crc(bytes: &[u8]) -> Result<()> {
    let header = BatchHeader::parse(bytes)?;
    let total = header.total_len();
    if bytes.len() < total {
        return Err(ProtocolError::Truncated {
            field: "batch_body",
            needed: total - bytes.len(),
        });
    }
    let computed = crc32c::crc32c(&bytes[ATTRIBUTES_OFFSET..total]);
    if computed != header.crc {
        return Err(ProtocolError::CrcMismatch {
            stored: header.crc,
            computed,
        });
    }
    Ok(())
}

/// Stamps the leader-assigned base offset and leader epoch into a raw batch.
/// Neither field is covered by the CRC.
pub fn stamp_batch(bytes: &mut [u8], base_offset: i64, leader_epoch: i32) {
    bytes[0..8].copy_from_slice(&base_offset.to_be_bytes());
    bytes[12..16].copy_from_slice(&leader_epoch.to_be_bytes());
}

/// Splits the next complete raw batch off the front of `buf`. Returns
/// `None` when the buffer is empty; errors if a batch is truncated.
pub fn split_next_batch(buf: &mut Bytes) -> Result<Option<(BatchHeader, Bytes)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let header = BatchHeader::parse(buf)?;
    let total = header.total_len();
    if buf.len() < total {
        return Err(ProtocolError::Truncated {
            field: "batch_body",
            needed: total - buf.len(),
        });
    }
    Ok(Some((header, buf.split_to(total))))
}

/// A record header (application key/value metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

/// One record inside a batch. Timestamps and offsets are deltas against the
/// batch header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub attributes: i8,
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    pub fn new(key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            attributes: 0,
            timestamp_delta: 0,
            offset_delta: 0,
            key,
            value,
            headers: Vec::new(),
        }
    }

    fn body_len(&self) -> usize {
        let mut len = 1; // attributes
        len += varlong_len(self.timestamp_delta);
        len += varint_len(self.offset_delta);
        len += match &self.key {
            Some(k) => varint_len(k.len() as i32) + k.len(),
            None => varint_len(-1),
        };
        len += match &self.value {
            Some(v) => varint_len(v.len() as i32) + v.len(),
            None => varint_len(-1),
        };
        len += varint_len(self.headers.len() as i32);
        for h in &self.headers {
            len += varint_len(h.key.len() as i32) + h.key.len();
            len += match &h.value {
                Some(v) => varint_len(v.len() as i32) + v.len(),
                None => varint_len(-1),
            };
        }
        len
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_varint(self.body_len() as i32);
        buf.put_i8(self.attributes);
        buf.put_varlong(self.timestamp_delta);
        buf.put_varint(self.offset_delta);
        match &self.key {
            Some(k) => {
                buf.put_varint(k.len() as i32);
                buf.put_slice(k);
            }
            None => buf.put_varint(-1),
        }
        match &self.value {
            Some(v) => {
                buf.put_varint(v.len() as i32);
                buf.put_slice(v);
            }
            None => buf.put_varint(-1),
        }
        buf.put_varint(self.headers.len() as i32);
        for h in &self.headers {
            buf.put_varint(h.key.len() as i32);
            buf.put_slice(h.key.as_bytes());
            match &h.value {
                Some(v) => {
                    buf.put_varint(v.len() as i32);
                    buf.put_slice(v);
                }
                None => buf.put_varint(-1),
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let len = buf.read_varint("record_length")?;
        if len < 0 {
            return Err(ProtocolError::InvalidLength {
                field: "record_length",
                len: len as i64,
            });
        }
        let mut body = buf.read_raw("record_body", len as usize)?;
        let attributes = body.read_i8("record_attributes")?;
        let timestamp_delta = body.read_varlong("timestamp_delta")?;
        let offset_delta = body.read_varint("offset_delta")?;
        let key = read_varint_bytes(&mut body, "record_key")?;
        let value = read_varint_bytes(&mut body, "record_value")?;
        let header_count = body.read_varint("header_count")?;
        if header_count < 0 {
            return Err(ProtocolError::InvalidLength {
                field: "header_count",
                len: header_count as i64,
            });
        }
        let mut headers = Vec::with_capacity((header_count as usize).min(body.len()));
        for _ in 0..header_count {
            let key = read_varint_bytes(&mut body, "header_key")?
                .ok_or(ProtocolError::InvalidLength {
                    field: "header_key",
                    len: -1,
                })?;
            let key = std::str::from_utf8(&key)
                .map_err(|_| ProtocolError::InvalidString { field: "header_key" })?
                .to_string();
            let value = read_varint_bytes(&mut body, "header_value")?;
            headers.push(RecordHeader { key, value });
        }
        if !body.is_empty() {
            return Err(ProtocolError::TrailingBytes(body.len()));
        }
        Ok(Self {
            attributes,
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers,
        })
    }
}

fn read_varint_bytes(buf: &mut Bytes, field: &'static str) -> Result<Option<Bytes>> {
    let len = buf.read_varint(field)?;
    if len < -1 {
        return Err(ProtocolError::InvalidLength {
            field,
            len: len as i64,
        });
    }
    if len == -1 {
        return Ok(None);
    }
    Ok(Some(buf.read_raw(field, len as usize)?))
}

/// A fully decoded record batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub first_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Builds an uncompressed batch from records, assigning offset and
    /// timestamp deltas from their order and `first_timestamp`.
    pub fn build(
        first_timestamp: i64,
        producer_id: i64,
        producer_epoch: i16,
        base_sequence: i32,
        mut records: Vec<Record>,
    ) -> Self {
        let mut max_timestamp = first_timestamp;
        for (i, record) in records.iter_mut().enumerate() {
            record.offset_delta = i as i32;
            max_timestamp = max_timestamp.max(first_timestamp + record.timestamp_delta);
        }
        let last_offset_delta = records.len().saturating_sub(1) as i32;
        Self {
            base_offset: 0,
            partition_leader_epoch: -1,
            attributes: 0,
            last_offset_delta,
            first_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch,
            base_sequence,
            records,
        }
    }

    /// Marks this batch as part of a transaction.
    pub fn set_transactional(&mut self) {
        self.attributes |= ATTR_TRANSACTIONAL;
    }

    /// Marks this batch as a control batch (transaction marker).
    pub fn set_control(&mut self) {
        self.attributes |= ATTR_CONTROL;
    }

    pub fn is_transactional(&self) -> bool {
        self.attributes & ATTR_TRANSACTIONAL != 0
    }

    pub fn is_control(&self) -> bool {
        self.attributes & ATTR_CONTROL != 0
    }

    /// Serializes the batch, computing batch_length and the CRC.
    pub fn encode(&self) -> Bytes {
        let mut records = BytesMut::new();
        for record in &self.records {
            record.encode(&mut records);
        }

        let mut buf = BytesMut::with_capacity(BATCH_HEADER_BYTES + records.len());
        buf.put_i64(self.base_offset);
        let batch_length = (BATCH_HEADER_BYTES - LOG_OVERHEAD) + records.len();
        buf.put_i32(batch_length as i32);
        buf.put_i32(self.partition_leader_epoch);
        buf.put_i8(MAGIC_V2);
        buf.put_u32(0); // crc, patched below
        buf.put_i16(self.attributes);
        buf.put_i32(self.last_offset_delta);
        buf.put_i64(self.first_timestamp);
        buf.put_i64(self.max_timestamp);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_i32(self.base_sequence);
        buf.put_i32(self.records.len() as i32);
        buf.put_slice(&records);

        let crc = crc32c::crc32c(&buf[ATTRIBUTES_OFFSET..]);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
        buf.freeze()
    }

    /// Decodes one batch from the front of `buf`, validating its CRC.
    /// Records are parsed only for uncompressed batches; compressed batches
    /// are rejected here (the broker stores and serves them opaquely via
    /// [`split_next_batch`]).
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let (header, raw) = split_next_batch(buf)?
            .ok_or(ProtocolError::MalformedBatch("empty buffer"))?;
        verify_batch_crc(&raw)?;
        if header.compression_codec() != 0 {
            return Err(ProtocolError::MalformedBatch(
                "compressed batches are not decoded record-wise",
            ));
        }
        let mut records_buf = raw.slice(BATCH_HEADER_BYTES..);
        let mut records = Vec::with_capacity(header.records_count.max(0) as usize);
        for _ in 0..header.records_count {
            records.push(Record::decode(&mut records_buf)?);
        }
        if !records_buf.is_empty() {
            return Err(ProtocolError::TrailingBytes(records_buf.len()));
        }
        Ok(Self {
            base_offset: header.base_offset,
            partition_leader_epoch: header.partition_leader_epoch,
            attributes: header.attributes,
            last_offset_delta: header.last_offset_delta,
            first_timestamp: header.first_timestamp,
            max_timestamp: header.max_timestamp,
            producer_id: header.producer_id,
            producer_epoch: header.producer_epoch,
            base_sequence: header.base_sequence,
            records,
        })
    }
}

/// Transaction control markers, written as the sole record of a control
/// batch. Key: version i16 + type i16 (abort = 0, commit = 1); value:
/// version i16 + coordinator epoch i32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMarker {
    Abort { coordinator_epoch: i32 },
    Commit { coordinator_epoch: i32 },
}

impl ControlMarker {
    const KEY_VERSION: i16 = 0;
    const VALUE_VERSION: i16 = 0;

    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit { .. })
    }

    pub fn coordinator_epoch(&self) -> i32 {
        match self {
            Self::Abort { coordinator_epoch } | Self::Commit { coordinator_epoch } => {
                *coordinator_epoch
            }
        }
    }

    pub fn to_record(self) -> Record {
        let marker_type: i16 = if self.is_commit() { 1 } else { 0 };
        let mut key = BytesMut::with_capacity(4);
        key.put_i16(Self::KEY_VERSION);
        key.put_i16(marker_type);
        let mut value = BytesMut::with_capacity(6);
        value.put_i16(Self::VALUE_VERSION);
        value.put_i32(self.coordinator_epoch());
        Record::new(Some(key.freeze()), Some(value.freeze()))
    }

    pub fn parse(record: &Record) -> Result<Self> {
        let mut key = record
            .key
            .clone()
            .ok_or(ProtocolError::MalformedBatch("control record without key"))?;
        let _version = key.read_i16("control_key_version")?;
        let marker_type = key.read_i16("control_key_type")?;
        let mut value = record
            .value
            .clone()
            .ok_or(ProtocolError::MalformedBatch("control record without value"))?;
        let _version = value.read_i16("control_value_version")?;
        let coordinator_epoch = value.read_i32("coordinator_epoch")?;
        match marker_type {
            0 => Ok(Self::Abort { coordinator_epoch }),
            1 => Ok(Self::Commit { coordinator_epoch }),
            _ => Err(ProtocolError::MalformedBatch("unknown control marker type")),
        }
    }

    /// Builds the complete control batch for one partition.
    pub fn to_batch(self, producer_id: i64, producer_epoch: i16, timestamp: i64) -> RecordBatch {
        let mut batch = RecordBatch::build(timestamp, producer_id, producer_epoch, -1, vec![
            self.to_record(),
        ]);
        batch.set_transactional();
        batch.set_control();
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> RecordBatch {
        let records = vec![
            Record::new(Some(Bytes::from_static(b"a")), Some(Bytes::from_static(b"1"))),
            Record {
                timestamp_delta: 5,
                ..Record::new(Some(Bytes::from_static(b"b")), Some(Bytes::from_static(b"2")))
            },
            Record {
                headers: vec![RecordHeader {
                    key: "source".into(),
                    value: Some(Bytes::from_static(b"test")),
                }],
                ..Record::new(None, Some(Bytes::from_static(b"3")))
            },
        ];
        RecordBatch::build(1_700_000_000_000, 42, 0, 5, records)
    }

    #[test]
    fn test_batch_round_trip() {
        let batch = sample_batch();
        let encoded = batch.encode();
        let mut buf = encoded.clone();
        let decoded = RecordBatch::decode(&mut buf).unwrap();
        assert_eq!(decoded, batch);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_parse_and_lengths() {
        let encoded = sample_batch().encode();
        let header = BatchHeader::parse(&encoded).unwrap();
        assert_eq!(header.magic, MAGIC_V2);
        assert_eq!(header.records_count, 3);
        assert_eq!(header.last_offset_delta, 2);
        assert_eq!(header.total_len(), encoded.len());
        assert_eq!(header.producer_id, 42);
        assert_eq!(header.base_sequence, 5);
        assert_eq!(header.last_sequence(), 7);
        verify_batch_crc(&encoded).unwrap();
    }

    #[test]
    fn test_stamping_preserves_crc() {
        let encoded = sample_batch().encode();
        let mut raw = encoded.to_vec();
        stamp_batch(&mut raw, 100, 3);
        let header = BatchHeader::parse(&raw).unwrap();
        assert_eq!(header.base_offset, 100);
        assert_eq!(header.partition_leader_epoch, 3);
        assert_eq!(header.last_offset(), 102);
        verify_batch_crc(&raw).unwrap();
    }

    #[test]
    fn test_corruption_detected() {
        let encoded = sample_batch().encode();
        let mut raw = encoded.to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(
            verify_batch_crc(&raw),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_split_concatenated_batches() {
        let one = sample_batch().encode();
        let two = sample_batch().encode();
        let mut joined = BytesMut::new();
        joined.put_slice(&one);
        joined.put_slice(&two);
        let mut buf = joined.freeze();

        let (h1, raw1) = split_next_batch(&mut buf).unwrap().unwrap();
        assert_eq!(raw1.len(), h1.total_len());
        let (_, raw2) = split_next_batch(&mut buf).unwrap().unwrap();
        assert_eq!(raw2, two);
        assert!(split_next_batch(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_control_marker_round_trip() {
        let marker = ControlMarker::Commit {
            coordinator_epoch: 9,
        };
        let batch = marker.to_batch(7, 0, 1_700_000_000_000);
        assert!(batch.is_control());
        assert!(batch.is_transactional());
        let parsed = ControlMarker::parse(&batch.records[0]).unwrap();
        assert_eq!(parsed, marker);

        let abort = ControlMarker::Abort {
            coordinator_epoch: 2,
        };
        let parsed = ControlMarker::parse(&abort.to_record()).unwrap();
        assert!(!parsed.is_commit());
    }

    #[test]
    fn test_truncated_batch_rejected() {
        let encoded = sample_batch().encode();
        let mut truncated = encoded.slice(..encoded.len() - 4);
        assert!(split_next_batch(&mut truncated).is_err());
    }
}
