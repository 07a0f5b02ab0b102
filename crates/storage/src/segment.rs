//! One log segment: the `.log` file plus its sparse offset and time
//! indexes.
//!
//! The partition's writer task owns a [`Segment`] (append handles and
//! index accounting). Concurrent readers see an [`Arc<SegmentShared>`]
//! whose readable length is published atomically after each write, so a
//! fetch never observes a half-written batch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, warn};

use protocol::records::{split_next_batch, verify_batch_crc, BatchHeader, BATCH_HEADER_BYTES};
use protocol::RecordBatch;

use crate::error::{Result, StorageError};
use crate::index::{OffsetIndex, OffsetIndexEntry, TimeIndex, TimeIndexEntry};

pub const LOG_EXTENSION: &str = "log";
pub const INDEX_EXTENSION: &str = "index";
pub const TIME_INDEX_EXTENSION: &str = "timeindex";
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

/// Base offsets are zero-padded to 20 digits so lexicographic order equals
/// numeric order.
pub fn format_base_offset(base_offset: i64) -> String {
    format!("{base_offset:020}")
}

pub fn segment_path(dir: &Path, base_offset: i64, extension: &str) -> PathBuf {
    dir.join(format!("{}.{extension}", format_base_offset(base_offset)))
}

/// Reader-visible state of a segment.
#[derive(Debug)]
pub struct SegmentShared {
    pub base_offset: i64,
    pub log_path: PathBuf,
    /// Bytes of the log file readers may touch; published after write.
    readable_len: AtomicU64,
    /// One past the last record offset stored in this segment.
    next_offset: AtomicI64,
    max_timestamp: AtomicI64,
    offset_index: RwLock<OffsetIndex>,
    time_index: RwLock<TimeIndex>,
}

impl SegmentShared {
    fn new(base_offset: i64, log_path: PathBuf) -> Self {
        Self {
            base_offset,
            log_path,
            readable_len: AtomicU64::new(0),
            next_offset: AtomicI64::new(base_offset),
            max_timestamp: AtomicI64::new(-1),
            offset_index: RwLock::new(OffsetIndex::new()),
            time_index: RwLock::new(TimeIndex::new()),
        }
    }

    /// Assembles the shared view of a freshly written compacted segment.
    pub(crate) fn for_compacted(
        base_offset: i64,
        log_path: PathBuf,
        readable_len: u64,
        next_offset: i64,
        max_timestamp: i64,
        offset_index: OffsetIndex,
        time_index: TimeIndex,
    ) -> Self {
        Self {
            base_offset,
            log_path,
            readable_len: AtomicU64::new(readable_len),
            next_offset: AtomicI64::new(next_offset),
            max_timestamp: AtomicI64::new(max_timestamp),
            offset_index: RwLock::new(offset_index),
            time_index: RwLock::new(time_index),
        }
    }

    pub fn readable_len(&self) -> u64 {
        self.readable_len.load(Ordering::Acquire)
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn max_timestamp(&self) -> i64 {
        self.max_timestamp.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.readable_len() == 0
    }

    fn name(&self) -> String {
        format_base_offset(self.base_offset)
    }

    /// File position a scan for `offset` starts at.
    fn scan_position(&self, offset: i64) -> u64 {
        if offset <= self.base_offset {
            return 0;
        }
        let relative = (offset - self.base_offset).min(u32::MAX as i64) as u32;
        self.offset_index
            .read()
            .lookup(relative)
            .map(|e| e.position as u64)
            .unwrap_or(0)
    }

    /// Reads a contiguous run of whole batches containing offsets
    /// `>= start_offset` and `< max_offset`, up to `max_bytes` (always at
    /// least one batch when any qualifies).
    pub async fn read_from(
        &self,
        start_offset: i64,
        max_offset: i64,
        max_bytes: usize,
    ) -> Result<Bytes> {
        let readable = self.readable_len();
        let mut pos = self.scan_position(start_offset);
        if pos >= readable {
            return Ok(Bytes::new());
        }

        let mut file = File::open(&self.log_path).await?;
        let mut out = BytesMut::new();
        let mut header_buf = [0u8; BATCH_HEADER_BYTES];

        while pos + BATCH_HEADER_BYTES as u64 <= readable {
            file.seek(SeekFrom::Start(pos)).await?;
            file.read_exact(&mut header_buf).await?;
            let header = BatchHeader::parse(&header_buf)?;
            let total = header.total_len() as u64;
            if pos + total > readable {
                // Published length never splits a batch; treat as end.
                break;
            }
            if header.last_offset() < start_offset {
                pos += total;
                continue;
            }
            if header.base_offset >= max_offset {
                break;
            }
            if !out.is_empty() && out.len() + total as usize > max_bytes {
                break;
            }
            let mut batch = vec![0u8; total as usize];
            file.seek(SeekFrom::Start(pos)).await?;
            file.read_exact(&mut batch).await?;
            out.extend_from_slice(&batch);
            pos += total;
            if out.len() >= max_bytes {
                break;
            }
        }
        Ok(out.freeze())
    }

    /// First offset whose timestamp is `>= target`, if this segment has one.
    pub async fn find_offset_by_timestamp(&self, target: i64) -> Result<Option<i64>> {
        if self.max_timestamp() < target {
            return Ok(None);
        }
        let start_relative = self.time_index.read().scan_start(target);
        let start_offset = self.base_offset + start_relative as i64;
        let readable = self.readable_len();
        let mut pos = self.scan_position(start_offset);

        let mut file = File::open(&self.log_path).await?;
        let mut header_buf = [0u8; BATCH_HEADER_BYTES];
        while pos + BATCH_HEADER_BYTES as u64 <= readable {
            file.seek(SeekFrom::Start(pos)).await?;
            file.read_exact(&mut header_buf).await?;
            let header = BatchHeader::parse(&header_buf)?;
            let total = header.total_len() as u64;
            if pos + total > readable {
                break;
            }
            if header.max_timestamp >= target {
                if header.compression_codec() == 0 {
                    let mut raw = vec![0u8; total as usize];
                    file.seek(SeekFrom::Start(pos)).await?;
                    file.read_exact(&mut raw).await?;
                    let mut buf = Bytes::from(raw);
                    let batch = RecordBatch::decode(&mut buf)?;
                    for record in &batch.records {
                        if batch.first_timestamp + record.timestamp_delta >= target {
                            return Ok(Some(batch.base_offset + record.offset_delta as i64));
                        }
                    }
                }
                // Compressed or imprecise: the batch start is the answer.
                return Ok(Some(header.base_offset));
            }
            pos += total;
        }
        Ok(None)
    }
}

/// Writer-side segment state, owned by the partition task.
pub struct Segment {
    pub shared: Arc<SegmentShared>,
    log_file: File,
    index_file: File,
    time_index_file: File,
    size_bytes: u64,
    bytes_since_index: u32,
    created_at_ms: i64,
    dirty: bool,
}

impl Segment {
    /// Creates a fresh, empty segment.
    pub async fn create(dir: &Path, base_offset: i64) -> Result<Self> {
        let log_path = segment_path(dir, base_offset, LOG_EXTENSION);
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        let index_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, base_offset, INDEX_EXTENSION))
            .await?;
        let time_index_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, base_offset, TIME_INDEX_EXTENSION))
            .await?;
        debug!(segment = %format_base_offset(base_offset), "Created segment");
        Ok(Self {
            shared: Arc::new(SegmentShared::new(base_offset, log_path)),
            log_file,
            index_file,
            time_index_file,
            size_bytes: 0,
            bytes_since_index: 0,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            dirty: false,
        })
    }

    /// Opens an existing segment for writing, rebuilding state from disk.
    ///
    /// Every batch is walked to recover the end offset and max timestamp;
    /// with `validate_crc` (the active segment after a crash) each batch's
    /// checksum is verified and the file is truncated at the first corrupt
    /// or partial batch. Unparseable index files are rebuilt from the walk.
    pub async fn open(dir: &Path, base_offset: i64, validate_crc: bool) -> Result<Self> {
        let name = format_base_offset(base_offset);
        let log_path = segment_path(dir, base_offset, LOG_EXTENSION);
        let bytes = tokio::fs::read(&log_path).await?;

        let mut valid_len = 0usize;
        let mut next_offset = base_offset;
        let mut max_timestamp = -1i64;
        let mut rebuilt_index = OffsetIndex::new();
        let mut rebuilt_time_index = TimeIndex::new();
        let mut buf = Bytes::from(bytes);
        loop {
            match split_next_batch(&mut buf) {
                Ok(Some((header, raw))) => {
                    if validate_crc {
                        if let Err(err) = verify_batch_crc(&raw) {
                            warn!(
                                segment = %name,
                                position = valid_len,
                                error = %err,
                                "Truncating segment at corrupt batch"
                            );
                            break;
                        }
                    }
                    if valid_len > 0 {
                        // Sparse rebuild: one entry per batch boundary is
                        // denser than index-interval-bytes but harmless.
                        rebuilt_index.push(OffsetIndexEntry {
                            relative_offset: (header.base_offset - base_offset) as u32,
                            position: valid_len as u32,
                        });
                    }
                    max_timestamp = max_timestamp.max(header.max_timestamp);
                    if max_timestamp >= 0 {
                        rebuilt_time_index.push(TimeIndexEntry {
                            timestamp: max_timestamp,
                            relative_offset: (header.last_offset() - base_offset) as u32,
                        });
                    }
                    next_offset = header.next_offset();
                    valid_len += raw.len();
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        segment = %name,
                        position = valid_len,
                        error = %err,
                        "Truncating segment at partial batch"
                    );
                    break;
                }
            }
        }

        if (valid_len as u64) < tokio::fs::metadata(&log_path).await?.len() {
            let file = OpenOptions::new().write(true).open(&log_path).await?;
            file.set_len(valid_len as u64).await?;
            file.sync_data().await?;
        }

        // Prefer the persisted indexes when they parse and agree with the
        // recovered log; otherwise rewrite them from the walk.
        let index_path = segment_path(dir, base_offset, INDEX_EXTENSION);
        let time_index_path = segment_path(dir, base_offset, TIME_INDEX_EXTENSION);
        let offset_index = match tokio::fs::read(&index_path).await {
            Ok(bytes) => match OffsetIndex::from_bytes(&name, &bytes) {
                Ok(index)
                    if index
                        .entries()
                        .last()
                        .map_or(true, |e| (e.position as usize) < valid_len) =>
                {
                    index
                }
                _ => {
                    warn!(segment = %name, "Rebuilding offset index");
                    tokio::fs::write(&index_path, index_bytes(&rebuilt_index)).await?;
                    rebuilt_index
                }
            },
            Err(_) => {
                tokio::fs::write(&index_path, index_bytes(&rebuilt_index)).await?;
                rebuilt_index
            }
        };
        let time_index = match tokio::fs::read(&time_index_path).await {
            Ok(bytes) => match TimeIndex::from_bytes(&name, &bytes) {
                Ok(index) => index,
                Err(_) => {
                    warn!(segment = %name, "Rebuilding time index");
                    tokio::fs::write(&time_index_path, time_index_bytes(&rebuilt_time_index))
                        .await?;
                    rebuilt_time_index
                }
            },
            Err(_) => {
                tokio::fs::write(&time_index_path, time_index_bytes(&rebuilt_time_index)).await?;
                rebuilt_time_index
            }
        };

        let created_at_ms = tokio::fs::metadata(&log_path)
            .await?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let shared = Arc::new(SegmentShared {
            base_offset,
            log_path: log_path.clone(),
            readable_len: AtomicU64::new(valid_len as u64),
            next_offset: AtomicI64::new(next_offset),
            max_timestamp: AtomicI64::new(max_timestamp),
            offset_index: RwLock::new(offset_index),
            time_index: RwLock::new(time_index),
        });

        Ok(Self {
            shared,
            log_file: OpenOptions::new().append(true).open(&log_path).await?,
            index_file: OpenOptions::new().append(true).open(&index_path).await?,
            time_index_file: OpenOptions::new()
                .append(true)
                .open(&time_index_path)
                .await?,
            size_bytes: valid_len as u64,
            bytes_since_index: 0,
            created_at_ms,
            dirty: false,
        })
    }

    pub fn base_offset(&self) -> i64 {
        self.shared.base_offset
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_at_ms
    }

    pub fn next_offset(&self) -> i64 {
        self.shared.next_offset()
    }

    /// Appends one already-stamped batch. The caller supplies offsets in
    /// the batch header; visibility is published only after the file write.
    pub async fn append(&mut self, raw: &[u8], header: &BatchHeader, index_interval: u32) -> Result<()> {
        let position = self.size_bytes;
        self.log_file.write_all(raw).await?;
        self.size_bytes += raw.len() as u64;
        self.dirty = true;

        let max_timestamp = self.shared.max_timestamp().max(header.max_timestamp);
        self.bytes_since_index += raw.len() as u32;
        if self.bytes_since_index >= index_interval && position > 0 {
            let entry = OffsetIndexEntry {
                relative_offset: (header.base_offset - self.shared.base_offset) as u32,
                position: position as u32,
            };
            self.index_file.write_all(&entry.to_bytes()).await?;
            self.shared.offset_index.write().push(entry);

            if max_timestamp >= 0 {
                let time_entry = TimeIndexEntry {
                    timestamp: max_timestamp,
                    relative_offset: (header.last_offset() - self.shared.base_offset) as u32,
                };
                self.time_index_file.write_all(&time_entry.to_bytes()).await?;
                self.shared.time_index.write().push(time_entry);
            }
            self.bytes_since_index = 0;
        }

        self.shared
            .max_timestamp
            .store(max_timestamp, Ordering::Release);
        self.shared
            .next_offset
            .store(header.next_offset(), Ordering::Release);
        self.shared
            .readable_len
            .store(self.size_bytes, Ordering::Release);
        Ok(())
    }

    /// fsyncs outstanding log writes.
    pub async fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.log_file.sync_data().await?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Discards everything at or above `target_offset` (a batch boundary).
    pub async fn truncate_to_offset(&mut self, target_offset: i64) -> Result<()> {
        let readable = self.shared.readable_len();
        let mut pos = self.shared.scan_position(target_offset);
        let mut file = File::open(&self.shared.log_path).await?;
        let mut header_buf = [0u8; BATCH_HEADER_BYTES];
        let mut max_timestamp = -1i64;
        while pos + BATCH_HEADER_BYTES as u64 <= readable {
            file.seek(SeekFrom::Start(pos)).await?;
            file.read_exact(&mut header_buf).await?;
            let header = BatchHeader::parse(&header_buf)?;
            if header.base_offset >= target_offset {
                break;
            }
            if header.last_offset() >= target_offset {
                return Err(StorageError::corrupt(
                    self.shared.name(),
                    format!("truncation offset {target_offset} is not a batch boundary"),
                ));
            }
            max_timestamp = max_timestamp.max(header.max_timestamp);
            pos += header.total_len() as u64;
        }
        drop(file);

        let relative = (target_offset - self.shared.base_offset).max(0) as u32;
        let dir = self.shared.log_path.parent().unwrap().to_path_buf();
        let index_snapshot = {
            let mut index = self.shared.offset_index.write();
            index.truncate_to(relative);
            index_bytes(&index)
        };
        tokio::fs::write(
            segment_path(&dir, self.shared.base_offset, INDEX_EXTENSION),
            index_snapshot,
        )
        .await?;
        let time_index_snapshot = {
            let mut time_index = self.shared.time_index.write();
            time_index.truncate_to(relative);
            time_index_bytes(&time_index)
        };
        tokio::fs::write(
            segment_path(&dir, self.shared.base_offset, TIME_INDEX_EXTENSION),
            time_index_snapshot,
        )
        .await?;

        let file = OpenOptions::new()
            .write(true)
            .open(&self.shared.log_path)
            .await?;
        file.set_len(pos).await?;
        file.sync_data().await?;

        self.size_bytes = pos;
        self.bytes_since_index = 0;
        self.shared.readable_len.store(pos, Ordering::Release);
        self.shared
            .next_offset
            .store(target_offset, Ordering::Release);
        self.shared
            .max_timestamp
            .store(max_timestamp, Ordering::Release);
        Ok(())
    }

    /// Flushes and closes the write handles, leaving the immutable shared
    /// view behind.
    pub async fn seal(mut self) -> Result<Arc<SegmentShared>> {
        self.flush().await?;
        self.index_file.sync_data().await?;
        self.time_index_file.sync_data().await?;
        Ok(self.shared)
    }
}

pub fn index_bytes(index: &OffsetIndex) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(index.len() * 8);
    for entry in index.entries() {
        bytes.extend_from_slice(&entry.to_bytes());
    }
    bytes
}

pub fn time_index_bytes(index: &TimeIndex) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(index.len() * 12);
    for entry in index.entries() {
        bytes.extend_from_slice(&entry.to_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use protocol::records::stamp_batch;
    use protocol::Record;

    fn batch(base_offset: i64, timestamp: i64, keys: &[&str]) -> (Bytes, BatchHeader) {
        let records = keys
            .iter()
            .map(|k| Record::new(Some(Bytes::copy_from_slice(k.as_bytes())), Some(Bytes::from_static(b"v"))))
            .collect();
        let built = RecordBatch::build(timestamp, -1, -1, -1, records);
        let mut raw = built.encode().to_vec();
        stamp_batch(&mut raw, base_offset, 0);
        let header = BatchHeader::parse(&raw).unwrap();
        (Bytes::from(raw), header)
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 0).await.unwrap();

        let (raw, header) = batch(0, 1000, &["a", "b"]);
        segment.append(&raw, &header, 4096).await.unwrap();
        let (raw2, header2) = batch(2, 2000, &["c"]);
        segment.append(&raw2, &header2, 4096).await.unwrap();

        assert_eq!(segment.next_offset(), 3);
        let read = segment.shared.read_from(0, i64::MAX, 1 << 20).await.unwrap();
        assert_eq!(read.len(), raw.len() + raw2.len());

        // Start mid-way: the first batch is skipped entirely.
        let read = segment.shared.read_from(2, i64::MAX, 1 << 20).await.unwrap();
        assert_eq!(read, raw2);

        // max_offset caps visibility at batch granularity.
        let read = segment.shared.read_from(0, 2, 1 << 20).await.unwrap();
        assert_eq!(read, raw);
    }

    #[tokio::test]
    async fn test_small_max_bytes_still_returns_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 0).await.unwrap();
        let (raw, header) = batch(0, 1000, &["a", "b", "c"]);
        segment.append(&raw, &header, 4096).await.unwrap();

        let read = segment.shared.read_from(0, i64::MAX, 1).await.unwrap();
        assert_eq!(read, raw);
    }

    #[tokio::test]
    async fn test_recovery_truncates_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (raw, header) = batch(0, 1000, &["a"]);
        let (raw2, header2) = batch(1, 2000, &["b"]);
        {
            let mut segment = Segment::create(dir.path(), 0).await.unwrap();
            segment.append(&raw, &header, 4096).await.unwrap();
            segment.append(&raw2, &header2, 4096).await.unwrap();
            segment.flush().await.unwrap();
        }
        // Simulate a crash mid-write of the second batch.
        let log_path = segment_path(dir.path(), 0, LOG_EXTENSION);
        let full = std::fs::read(&log_path).unwrap();
        std::fs::write(&log_path, &full[..full.len() - 3]).unwrap();

        let segment = Segment::open(dir.path(), 0, true).await.unwrap();
        assert_eq!(segment.next_offset(), 1);
        assert_eq!(segment.size_bytes(), raw.len() as u64);
        let read = segment.shared.read_from(0, i64::MAX, 1 << 20).await.unwrap();
        assert_eq!(read, raw);
    }

    #[tokio::test]
    async fn test_recovery_detects_corrupt_crc() {
        let dir = tempfile::tempdir().unwrap();
        let (raw, header) = batch(0, 1000, &["a"]);
        let (raw2, header2) = batch(1, 2000, &["b"]);
        {
            let mut segment = Segment::create(dir.path(), 0).await.unwrap();
            segment.append(&raw, &header, 4096).await.unwrap();
            segment.append(&raw2, &header2, 4096).await.unwrap();
            segment.flush().await.unwrap();
        }
        // Flip a byte inside the second batch's payload.
        let log_path = segment_path(dir.path(), 0, LOG_EXTENSION);
        let mut full = std::fs::read(&log_path).unwrap();
        let n = full.len();
        full[n - 1] ^= 0xff;
        std::fs::write(&log_path, &full).unwrap();

        let segment = Segment::open(dir.path(), 0, true).await.unwrap();
        assert_eq!(segment.next_offset(), 1);
    }

    #[tokio::test]
    async fn test_truncate_to_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 0).await.unwrap();
        let (raw, header) = batch(0, 1000, &["a"]);
        let (raw2, header2) = batch(1, 2000, &["b", "c"]);
        segment.append(&raw, &header, 4096).await.unwrap();
        segment.append(&raw2, &header2, 4096).await.unwrap();
        assert_eq!(segment.next_offset(), 3);

        segment.truncate_to_offset(1).await.unwrap();
        assert_eq!(segment.next_offset(), 1);
        let read = segment.shared.read_from(0, i64::MAX, 1 << 20).await.unwrap();
        assert_eq!(read, raw);

        // Appending after truncation continues at the new end.
        let (raw3, header3) = batch(1, 3000, &["d"]);
        segment.append(&raw3, &header3, 4096).await.unwrap();
        assert_eq!(segment.next_offset(), 2);
    }

    #[tokio::test]
    async fn test_timestamp_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 0).await.unwrap();
        let (raw, header) = batch(0, 1000, &["a", "b"]);
        let (raw2, header2) = batch(2, 5000, &["c"]);
        segment.append(&raw, &header, 4096).await.unwrap();
        segment.append(&raw2, &header2, 4096).await.unwrap();

        assert_eq!(
            segment.shared.find_offset_by_timestamp(0).await.unwrap(),
            Some(0)
        );
        assert_eq!(
            segment.shared.find_offset_by_timestamp(1001).await.unwrap(),
            Some(2)
        );
        assert_eq!(
            segment.shared.find_offset_by_timestamp(6000).await.unwrap(),
            None
        );
    }
}
