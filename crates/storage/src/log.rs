//! The partition log: segments orchestrated for one partition.
//!
//! A [`PartitionLog`] is owned by exactly one writer task (see
//! [`crate::partition`]); it is the only mutator of segments, producer
//! state, and the checkpoint. Readers go through the [`PartitionShared`]
//! handle, which publishes LEO / HWM / last-stable-offset through atomics
//! and watch channels and reads segment files directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use broker_core::{CleanupPolicy, StorageConfig, TopicConfig, TopicPartition};
use protocol::records::{split_next_batch, stamp_batch, verify_batch_crc, BatchHeader};
use protocol::{ControlMarker, RecordBatch};

use crate::error::{Result, StorageError};
use crate::producer_state::{AbortedTxn, ProducerStateManager, SequenceOutcome};
use crate::segment::{segment_path, Segment, SegmentShared, INDEX_EXTENSION, LOG_EXTENSION, TIME_INDEX_EXTENSION};

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Visibility ceiling for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCeiling {
    /// Consumers: nothing at or above the high watermark.
    HighWatermark,
    /// Read-committed consumers: nothing at or above the last stable offset.
    LastStable,
    /// Follower replicas: everything up to the log end offset.
    LogEnd,
}

/// Result of a leader append.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub base_offset: i64,
    pub last_offset: i64,
    pub max_timestamp: i64,
    /// The batch was a resend already in the log; nothing was appended.
    pub duplicate: bool,
}

/// One read result, with the watermarks observed at read time.
#[derive(Debug, Clone)]
pub struct FetchSlice {
    pub records: Bytes,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
    pub aborted: Vec<AbortedTxn>,
}

/// What recovery found when opening a partition directory.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryReport {
    pub segments: usize,
    pub log_start_offset: i64,
    pub log_end_offset: i64,
    pub high_watermark: i64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Checkpoint {
    log_start_offset: i64,
    high_watermark: i64,
}

/// Reader-facing partition state.
#[derive(Debug)]
pub struct PartitionShared {
    pub tp: TopicPartition,
    leo: AtomicI64,
    log_start: AtomicI64,
    last_stable: AtomicI64,
    hwm_tx: watch::Sender<i64>,
    leo_tx: watch::Sender<i64>,
    segments: RwLock<BTreeMap<i64, Arc<SegmentShared>>>,
    aborted: RwLock<Vec<AbortedTxn>>,
}

impl PartitionShared {
    fn new(tp: TopicPartition) -> Self {
        let (hwm_tx, _) = watch::channel(0i64);
        let (leo_tx, _) = watch::channel(0i64);
        Self {
            tp,
            leo: AtomicI64::new(0),
            log_start: AtomicI64::new(0),
            last_stable: AtomicI64::new(0),
            hwm_tx,
            leo_tx,
            segments: RwLock::new(BTreeMap::new()),
            aborted: RwLock::new(Vec::new()),
        }
    }

    pub fn log_end_offset(&self) -> i64 {
        self.leo.load(Ordering::Acquire)
    }

    pub fn high_watermark(&self) -> i64 {
        *self.hwm_tx.borrow()
    }

    pub fn log_start_offset(&self) -> i64 {
        self.log_start.load(Ordering::Acquire)
    }

    pub fn last_stable_offset(&self) -> i64 {
        self.last_stable.load(Ordering::Acquire)
    }

    /// Watch channel that ticks whenever the HWM advances.
    pub fn hwm_receiver(&self) -> watch::Receiver<i64> {
        self.hwm_tx.subscribe()
    }

    /// Watch channel that ticks whenever the LEO advances.
    pub fn leo_receiver(&self) -> watch::Receiver<i64> {
        self.leo_tx.subscribe()
    }

    fn ceiling_offset(&self, ceiling: ReadCeiling) -> i64 {
        match ceiling {
            ReadCeiling::HighWatermark => self.high_watermark(),
            ReadCeiling::LastStable => self.last_stable_offset(),
            ReadCeiling::LogEnd => self.log_end_offset(),
        }
    }

    /// Reads whole batches from `start` up to `max_bytes`, bounded by the
    /// ceiling. `start == LEO` yields an empty slice; offsets outside
    /// `[log_start, LEO]` are out of range.
    pub async fn read(
        &self,
        start: i64,
        max_bytes: usize,
        ceiling: ReadCeiling,
    ) -> Result<FetchSlice> {
        let log_start = self.log_start_offset();
        let leo = self.log_end_offset();
        if start < log_start || start > leo {
            return Err(StorageError::OffsetOutOfRange {
                offset: start,
                start: log_start,
                end: leo,
            });
        }
        let max_offset = self.ceiling_offset(ceiling);
        let hwm = self.high_watermark();
        let lso = self.last_stable_offset();

        let mut out = BytesMut::new();
        if start < max_offset {
            let segments: Vec<Arc<SegmentShared>> = {
                let map = self.segments.read();
                let first = map
                    .range(..=start)
                    .next_back()
                    .map(|(base, _)| *base)
                    .unwrap_or_else(|| map.keys().next().copied().unwrap_or(0));
                map.range(first..).map(|(_, s)| s.clone()).collect()
            };
            let mut cursor = start;
            for segment in segments {
                if cursor >= max_offset || out.len() >= max_bytes {
                    break;
                }
                let remaining = max_bytes - out.len();
                let chunk = segment.read_from(cursor, max_offset, remaining).await?;
                if !chunk.is_empty() {
                    // Continue from one past the last batch returned.
                    let mut walk = chunk.clone();
                    while let Some((header, _)) = split_next_batch(&mut walk)? {
                        cursor = header.next_offset();
                    }
                    out.extend_from_slice(&chunk);
                } else {
                    cursor = cursor.max(segment.next_offset());
                }
            }
        }

        let end = if out.is_empty() { start } else {
            // End of the returned range bounds the aborted-txn report.
            self.log_end_offset().min(max_offset)
        };
        let aborted = if matches!(ceiling, ReadCeiling::LastStable | ReadCeiling::LogEnd) {
            let list = self.aborted.read();
            list.iter()
                .filter(|a| a.marker_offset >= start && a.first_offset < end)
                .copied()
                .collect()
        } else {
            Vec::new()
        };

        Ok(FetchSlice {
            records: out.freeze(),
            high_watermark: hwm,
            last_stable_offset: lso,
            log_start_offset: log_start,
            aborted,
        })
    }

    pub(crate) fn segments(
        &self,
    ) -> parking_lot::RwLockReadGuard<'_, BTreeMap<i64, Arc<SegmentShared>>> {
        self.segments.read()
    }

    pub(crate) fn segments_mut(
        &self,
    ) -> parking_lot::RwLockWriteGuard<'_, BTreeMap<i64, Arc<SegmentShared>>> {
        self.segments.write()
    }

    /// First offset with a timestamp at or after `target`.
    pub async fn offset_for_timestamp(&self, target: i64) -> Result<Option<i64>> {
        let segments: Vec<Arc<SegmentShared>> =
            self.segments.read().values().cloned().collect();
        for segment in segments {
            if let Some(offset) = segment.find_offset_by_timestamp(target).await? {
                if offset >= self.log_start_offset() {
                    return Ok(Some(offset));
                }
            }
        }
        Ok(None)
    }
}

/// Writer-side partition log. All mutation funnels through here.
pub struct PartitionLog {
    tp: TopicPartition,
    dir: PathBuf,
    topic_config: TopicConfig,
    storage_config: Arc<StorageConfig>,
    shared: Arc<PartitionShared>,
    active: Segment,
    producers: ProducerStateManager,
    leader_epoch: i32,
    appends_since_flush: u64,
    last_flush_ms: i64,
    /// Tombstone offsets carried through a compaction pass, with the time
    /// they may be dropped.
    tombstone_horizons: BTreeMap<i64, i64>,
}

impl PartitionLog {
    /// Opens (or creates) the partition directory, running crash recovery.
    pub async fn open(
        dir: PathBuf,
        tp: TopicPartition,
        topic_config: TopicConfig,
        storage_config: Arc<StorageConfig>,
    ) -> Result<(Self, RecoveryReport)> {
        tokio::fs::create_dir_all(&dir).await?;

        let mut bases = list_segment_bases(&dir).await?;
        bases.sort_unstable();

        let shared = Arc::new(PartitionShared::new(tp.clone()));
        let mut sealed: BTreeMap<i64, Arc<SegmentShared>> = BTreeMap::new();

        let active = if bases.is_empty() {
            Segment::create(&dir, 0).await?
        } else {
            let last = *bases.last().unwrap();
            for &base in &bases[..bases.len() - 1] {
                let segment = Segment::open(&dir, base, false).await?;
                sealed.insert(base, segment.seal().await?);
            }
            let mut active = Segment::open(&dir, last, true).await?;
            if active.size_bytes() == 0 && !sealed.is_empty() {
                // A crash can leave a freshly rolled, never-written segment.
                info!(partition = %tp, segment = last, "Discarding empty segment left by crash");
                remove_segment_files(&dir, last).await;
                let (&prev, _) = sealed.iter().next_back().unwrap();
                sealed.remove(&prev);
                active = Segment::open(&dir, prev, true).await?;
            }
            active
        };

        let checkpoint = read_checkpoint(&dir).await;
        let leo = active.next_offset();
        let first_base = sealed
            .keys()
            .next()
            .copied()
            .unwrap_or(active.base_offset());
        let log_start = checkpoint.log_start_offset.max(first_base);
        let hwm = checkpoint.high_watermark.clamp(0, leo);

        {
            let mut map = shared.segments.write();
            for (base, segment) in &sealed {
                map.insert(*base, segment.clone());
            }
            map.insert(active.base_offset(), active.shared.clone());
        }
        shared.leo.store(leo, Ordering::Release);
        shared.log_start.store(log_start, Ordering::Release);
        let _ = shared.leo_tx.send(leo);
        let _ = shared.hwm_tx.send(hwm);

        let mut log = Self {
            tp: tp.clone(),
            dir,
            topic_config,
            storage_config,
            shared,
            active,
            producers: ProducerStateManager::new(),
            leader_epoch: 0,
            appends_since_flush: 0,
            last_flush_ms: chrono::Utc::now().timestamp_millis(),
            tombstone_horizons: BTreeMap::new(),
        };
        log.rebuild_producer_state().await?;
        log.publish_txn_state();

        let report = RecoveryReport {
            segments: log.shared.segments.read().len(),
            log_start_offset: log_start,
            log_end_offset: leo,
            high_watermark: hwm,
        };
        info!(
            partition = %log.tp,
            segments = report.segments,
            log_start = report.log_start_offset,
            leo = report.log_end_offset,
            hwm = report.high_watermark,
            "Recovered partition log"
        );
        Ok((log, report))
    }

    async fn rebuild_producer_state(&mut self) -> Result<()> {
        self.producers = ProducerStateManager::load_latest(&self.dir).await?;
        let from = self.producers.snapshot_offset().max(self.log_start());
        let leo = self.log_end_offset();
        if from >= leo {
            return Ok(());
        }
        let mut cursor = from;
        while cursor < leo {
            let slice = self.shared.read(cursor, 4 * 1024 * 1024, ReadCeiling::LogEnd).await?;
            if slice.records.is_empty() {
                break;
            }
            let mut buf = slice.records.clone();
            while let Some((header, raw)) = split_next_batch(&mut buf)? {
                self.replay_batch(&header, &raw)?;
                cursor = header.next_offset();
            }
        }
        Ok(())
    }

    fn replay_batch(&mut self, header: &BatchHeader, raw: &Bytes) -> Result<()> {
        if header.is_control() {
            if let Ok(batch) = RecordBatch::decode(&mut raw.clone()) {
                if let Some(record) = batch.records.first() {
                    if let Ok(marker) = ControlMarker::parse(record) {
                        self.producers
                            .on_control(header.producer_id, marker, header.base_offset);
                    }
                }
            }
        } else {
            self.producers.on_append(header, header.max_timestamp);
        }
        Ok(())
    }

    pub fn shared(&self) -> Arc<PartitionShared> {
        self.shared.clone()
    }

    pub fn log_end_offset(&self) -> i64 {
        self.shared.log_end_offset()
    }

    pub fn high_watermark(&self) -> i64 {
        self.shared.high_watermark()
    }

    pub fn log_start(&self) -> i64 {
        self.shared.log_start_offset()
    }

    pub fn topic_config(&self) -> &TopicConfig {
        &self.topic_config
    }

    pub fn set_topic_config(&mut self, config: TopicConfig) {
        self.topic_config = config;
    }

    pub fn set_leader_epoch(&mut self, epoch: i32) {
        self.leader_epoch = epoch;
    }

    pub fn leader_epoch(&self) -> i32 {
        self.leader_epoch
    }

    /// Leader append: validates, dedupes, assigns offsets, writes, and
    /// applies the flush policy.
    pub async fn append_leader(&mut self, records: Bytes) -> Result<AppendOutcome> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut buf = records;
        let mut first: Option<AppendOutcome> = None;
        let mut appended = false;

        while let Some((header, raw)) = split_next_batch(&mut buf)? {
            if raw.len() > self.topic_config.max_message_bytes {
                return Err(StorageError::MessageTooLarge(raw.len()));
            }
            verify_batch_crc(&raw)?;

            match self.producers.check_batch(&header)? {
                SequenceOutcome::Duplicate {
                    base_offset,
                    max_timestamp,
                } => {
                    debug!(
                        partition = %self.tp,
                        producer_id = header.producer_id,
                        base_sequence = header.base_sequence,
                        "Duplicate batch, returning cached append result"
                    );
                    let outcome = AppendOutcome {
                        base_offset,
                        last_offset: base_offset + header.last_offset_delta as i64,
                        max_timestamp,
                        duplicate: true,
                    };
                    first.get_or_insert(outcome);
                    continue;
                }
                SequenceOutcome::Accept => {}
            }

            let base_offset = self.log_end_offset();
            let mut stamped = raw.to_vec();
            stamp_batch(&mut stamped, base_offset, self.leader_epoch);
            let stamped_header = BatchHeader::parse(&stamped)?;

            self.roll_if_needed(stamped.len() as u64, now_ms).await?;
            self.active
                .append(&stamped, &stamped_header, self.storage_config.index_interval_bytes)
                .await?;
            appended = true;

            if stamped_header.is_control() {
                let raw_bytes = Bytes::from(stamped.clone());
                self.replay_batch(&stamped_header, &raw_bytes)?;
            } else {
                self.producers.on_append(&stamped_header, now_ms);
            }

            let leo = stamped_header.next_offset();
            self.shared.leo.store(leo, Ordering::Release);
            let _ = self.shared.leo_tx.send(leo);

            first.get_or_insert(AppendOutcome {
                base_offset,
                last_offset: stamped_header.last_offset(),
                max_timestamp: stamped_header.max_timestamp,
                duplicate: false,
            });
        }

        let outcome = first.ok_or_else(|| StorageError::InvalidBatch("empty produce payload".into()))?;
        if appended {
            self.publish_txn_state();
            self.apply_flush_policy(now_ms).await?;
            telemetry::metrics().batches_appended.inc();
        }
        Ok(outcome)
    }

    /// Follower append: offsets come pre-assigned from the leader and must
    /// line up exactly with our log end offset.
    pub async fn append_follower(&mut self, records: Bytes) -> Result<i64> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut buf = records;
        while let Some((header, raw)) = split_next_batch(&mut buf)? {
            let leo = self.log_end_offset();
            if header.base_offset != leo {
                return Err(StorageError::Divergent {
                    expected: leo,
                    got: header.base_offset,
                });
            }
            verify_batch_crc(&raw)?;
            self.roll_if_needed(raw.len() as u64, now_ms).await?;
            self.active
                .append(&raw, &header, self.storage_config.index_interval_bytes)
                .await?;
            self.replay_batch(&header, &raw)?;

            let new_leo = header.next_offset();
            self.shared.leo.store(new_leo, Ordering::Release);
            let _ = self.shared.leo_tx.send(new_leo);
        }
        self.publish_txn_state();
        self.apply_flush_policy(now_ms).await?;
        Ok(self.log_end_offset())
    }

    /// Advances the high watermark (monotonic, clamped to LEO) and wakes
    /// parked fetches.
    pub fn advance_hwm(&mut self, new_hwm: i64) -> i64 {
        let clamped = new_hwm.min(self.log_end_offset());
        let mut advanced = self.high_watermark();
        self.shared.hwm_tx.send_if_modified(|current| {
            if clamped > *current {
                *current = clamped;
                advanced = clamped;
                true
            } else {
                false
            }
        });
        self.publish_txn_state();
        advanced
    }

    fn publish_txn_state(&self) {
        let hwm = self.high_watermark();
        let lso = self
            .producers
            .earliest_open_txn()
            .map_or(hwm, |first| first.min(hwm));
        self.shared.last_stable.store(lso, Ordering::Release);
        *self.shared.aborted.write() = self.producers.aborted_in_range(i64::MIN, i64::MAX);
    }

    async fn roll_if_needed(&mut self, incoming_len: u64, now_ms: i64) -> Result<()> {
        let size = self.active.size_bytes();
        if size == 0 {
            return Ok(());
        }
        let over_size = size + incoming_len > self.topic_config.segment_bytes;
        let over_age = self.topic_config.segment_ms > 0
            && self.active.age_ms(now_ms) >= self.topic_config.segment_ms;
        if over_size || over_age {
            self.roll().await?;
        }
        Ok(())
    }

    /// Seals the active segment and opens a new one at the log end offset.
    pub async fn roll(&mut self) -> Result<()> {
        let leo = self.log_end_offset();
        debug!(partition = %self.tp, base_offset = leo, "Rolling segment");
        let new_active = Segment::create(&self.dir, leo).await?;
        let old = std::mem::replace(&mut self.active, new_active);
        let old_shared = old.seal().await?;
        self.shared
            .segments
            .write()
            .insert(old_shared.base_offset, old_shared);
        self.shared
            .segments
            .write()
            .insert(self.active.base_offset(), self.active.shared.clone());
        self.producers.write_snapshot(&self.dir, leo).await?;
        Ok(())
    }

    /// Discards everything at or above `offset` (batch boundaries only).
    pub async fn truncate_to(&mut self, offset: i64) -> Result<()> {
        let leo = self.log_end_offset();
        if offset >= leo {
            return Ok(());
        }
        warn!(partition = %self.tp, from = leo, to = offset, "Truncating log");

        // The segment that will contain the new log end.
        let target_base = {
            let map = self.shared.segments.read();
            map.range(..=offset).next_back().map(|(b, _)| *b)
        };

        match target_base {
            Some(target_base) => {
                // Drop every segment above the target.
                let doomed: Vec<i64> = {
                    let map = self.shared.segments.read();
                    map.range(target_base + 1..).map(|(b, _)| *b).collect()
                };
                for base in doomed {
                    self.shared.segments.write().remove(&base);
                    remove_segment_files(&self.dir, base).await;
                }
                // The target becomes the active (writable) segment again.
                if self.active.base_offset() != target_base {
                    self.active = Segment::open(&self.dir, target_base, false).await?;
                    self.shared
                        .segments
                        .write()
                        .insert(target_base, self.active.shared.clone());
                }
                if self.active.next_offset() > offset {
                    self.active.truncate_to_offset(offset).await?;
                }
            }
            None => {
                // Truncating below the first segment: the log restarts empty.
                let doomed: Vec<i64> =
                    self.shared.segments.read().keys().copied().collect();
                for base in doomed {
                    self.shared.segments.write().remove(&base);
                    remove_segment_files(&self.dir, base).await;
                }
                self.active = Segment::create(&self.dir, offset).await?;
                self.shared
                    .segments
                    .write()
                    .insert(offset, self.active.shared.clone());
            }
        }

        let new_leo = self.active.next_offset();
        self.shared.leo.store(new_leo, Ordering::Release);
        let _ = self.shared.leo_tx.send(new_leo);
        self.shared.hwm_tx.send_if_modified(|hwm| {
            if *hwm > new_leo {
                *hwm = new_leo;
                true
            } else {
                false
            }
        });
        // Sequence windows above the truncation point are no longer valid.
        self.rebuild_producer_state().await?;
        self.publish_txn_state();
        Ok(())
    }

    /// Raises the log start offset (`DeleteRecords`); segments wholly below
    /// it are removed by the next retention pass.
    pub async fn delete_records(&mut self, offset: i64) -> Result<i64> {
        let target = if offset < 0 {
            self.high_watermark()
        } else {
            offset
        };
        if target > self.high_watermark() {
            return Err(StorageError::OffsetOutOfRange {
                offset: target,
                start: self.log_start(),
                end: self.high_watermark(),
            });
        }
        let new_start = self.log_start().max(target);
        self.shared.log_start.store(new_start, Ordering::Release);
        self.producers.evict_aborted_below(new_start);
        self.publish_txn_state();
        self.write_checkpoint().await?;
        Ok(new_start)
    }

    /// Deletes sealed segments that have fallen past retention. The active
    /// segment is never deleted.
    pub async fn enforce_retention(&mut self, now_ms: i64) -> Result<usize> {
        let mut deleted = 0usize;
        let retention_ms = self.topic_config.retention_ms;
        let retention_bytes = self.topic_config.retention_bytes;
        let delete_by_policy = self.topic_config.cleanup_policy == CleanupPolicy::Delete;

        loop {
            let (first_base, first_max_ts, total_bytes) = {
                let map = self.shared.segments.read();
                let total: u64 = map.values().map(|s| s.readable_len()).sum();
                match map.iter().next() {
                    Some((base, seg)) if *base != self.active.base_offset() => {
                        (*base, seg.max_timestamp(), total)
                    }
                    _ => break,
                }
            };

            let first_next = self
                .shared
                .segments
                .read()
                .get(&first_base)
                .map(|s| s.next_offset())
                .unwrap_or(first_base);

            let below_log_start = first_next <= self.log_start();
            let past_time = delete_by_policy
                && retention_ms >= 0
                && first_max_ts >= 0
                && now_ms - first_max_ts > retention_ms;
            let over_size = delete_by_policy
                && retention_bytes >= 0
                && total_bytes as i64 > retention_bytes;

            if !(below_log_start || past_time || over_size) {
                break;
            }

            debug!(
                partition = %self.tp,
                segment = first_base,
                below_log_start,
                past_time,
                over_size,
                "Deleting segment past retention"
            );
            self.shared.segments.write().remove(&first_base);
            remove_segment_files(&self.dir, first_base).await;
            deleted += 1;

            let new_start = {
                let map = self.shared.segments.read();
                map.keys().next().copied().unwrap_or(first_next)
            };
            let new_start = new_start.max(self.log_start());
            self.shared.log_start.store(new_start, Ordering::Release);
            self.producers.evict_aborted_below(new_start);
        }

        if deleted > 0 {
            self.publish_txn_state();
            self.write_checkpoint().await?;
        }
        Ok(deleted)
    }

    /// Applies the configured flush policy after an append.
    async fn apply_flush_policy(&mut self, now_ms: i64) -> Result<()> {
        self.appends_since_flush += 1;
        match self.storage_config.flush_mode {
            broker_core::FlushMode::Ack => self.flush().await,
            broker_core::FlushMode::Interval => {
                if self.appends_since_flush >= self.storage_config.flush_messages
                    || now_ms - self.last_flush_ms >= self.storage_config.flush_interval_ms as i64
                {
                    self.flush().await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// fsyncs the active segment and refreshes the checkpoint.
    pub async fn flush(&mut self) -> Result<()> {
        self.active.flush().await?;
        self.appends_since_flush = 0;
        self.last_flush_ms = chrono::Utc::now().timestamp_millis();
        self.write_checkpoint().await
    }

    /// Periodic duties: age-based roll, retention, compaction, producer
    /// expiry.
    pub async fn run_maintenance(&mut self, now_ms: i64) -> Result<()> {
        if self.active.size_bytes() > 0
            && self.topic_config.segment_ms > 0
            && self.active.age_ms(now_ms) >= self.topic_config.segment_ms
        {
            self.roll().await?;
        }
        self.enforce_retention(now_ms).await?;
        if self.topic_config.cleanup_policy == CleanupPolicy::Compact {
            crate::compaction::compact_once(self, now_ms).await?;
        }
        let evicted = self
            .producers
            .evict_expired(now_ms, self.storage_config.producer_id_expiration_ms);
        if evicted > 0 {
            debug!(partition = %self.tp, evicted, "Evicted idle producer state");
        }
        Ok(())
    }

    /// Flush + snapshot on shutdown.
    pub async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        let leo = self.log_end_offset();
        self.producers.write_snapshot(&self.dir, leo).await?;
        Ok(())
    }

    async fn write_checkpoint(&self) -> Result<()> {
        let checkpoint = Checkpoint {
            log_start_offset: self.log_start(),
            high_watermark: self.high_watermark(),
        };
        let json = serde_json::to_vec(&checkpoint)
            .map_err(|e| StorageError::corrupt("checkpoint", e.to_string()))?;
        tokio::fs::write(self.dir.join(CHECKPOINT_FILE), json).await?;
        Ok(())
    }

    // Internal accessors for the compaction pass.
    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn shared_ref(&self) -> &PartitionShared {
        &self.shared
    }

    pub(crate) fn active_base(&self) -> i64 {
        self.active.base_offset()
    }

    pub(crate) fn tombstone_horizons(&mut self) -> &mut BTreeMap<i64, i64> {
        &mut self.tombstone_horizons
    }

    pub(crate) fn delete_retention_ms(&self) -> i64 {
        self.topic_config.delete_retention_ms
    }
}

async fn list_segment_bases(dir: &Path) -> Result<Vec<i64>> {
    let mut bases = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(&format!(".{LOG_EXTENSION}")) {
            if let Ok(base) = stem.parse::<i64>() {
                bases.push(base);
            }
        }
    }
    Ok(bases)
}

async fn read_checkpoint(dir: &Path) -> Checkpoint {
    match tokio::fs::read(dir.join(CHECKPOINT_FILE)).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => Checkpoint::default(),
    }
}

pub(crate) async fn remove_segment_files(dir: &Path, base_offset: i64) {
    for extension in [LOG_EXTENSION, INDEX_EXTENSION, TIME_INDEX_EXTENSION] {
        let _ = tokio::fs::remove_file(segment_path(dir, base_offset, extension)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Record;

    fn topic_config() -> TopicConfig {
        TopicConfig::from_storage(&StorageConfig::default())
    }

    fn storage_config() -> Arc<StorageConfig> {
        Arc::new(StorageConfig::default())
    }

    fn client_batch(keys: &[(&str, Option<&str>)], pid: i64, epoch: i16, base_seq: i32) -> Bytes {
        let records = keys
            .iter()
            .map(|(k, v)| {
                Record::new(
                    Some(Bytes::copy_from_slice(k.as_bytes())),
                    v.map(|v| Bytes::copy_from_slice(v.as_bytes())),
                )
            })
            .collect();
        RecordBatch::build(chrono::Utc::now().timestamp_millis(), pid, epoch, base_seq, records)
            .encode()
    }

    async fn open_log(dir: &Path) -> PartitionLog {
        let (log, _) = PartitionLog::open(
            dir.to_path_buf(),
            TopicPartition::new("orders", 0),
            topic_config(),
            storage_config(),
        )
        .await
        .unwrap();
        log
    }

    #[tokio::test]
    async fn test_append_assigns_dense_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path()).await;

        let out = log
            .append_leader(client_batch(&[("a", Some("1")), ("b", Some("2"))], -1, -1, -1))
            .await
            .unwrap();
        assert_eq!(out.base_offset, 0);
        assert_eq!(out.last_offset, 1);

        let out = log
            .append_leader(client_batch(&[("c", Some("3"))], -1, -1, -1))
            .await
            .unwrap();
        assert_eq!(out.base_offset, 2);
        assert_eq!(log.log_end_offset(), 3);
    }

    #[tokio::test]
    async fn test_consumers_capped_at_hwm() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path()).await;
        log.append_leader(client_batch(&[("a", Some("1"))], -1, -1, -1))
            .await
            .unwrap();
        log.append_leader(client_batch(&[("b", Some("2"))], -1, -1, -1))
            .await
            .unwrap();

        let shared = log.shared();
        // HWM still 0: consumers see nothing, followers see everything.
        let slice = shared.read(0, 1 << 20, ReadCeiling::HighWatermark).await.unwrap();
        assert!(slice.records.is_empty());
        let slice = shared.read(0, 1 << 20, ReadCeiling::LogEnd).await.unwrap();
        assert!(!slice.records.is_empty());

        log.advance_hwm(2);
        let slice = shared.read(0, 1 << 20, ReadCeiling::HighWatermark).await.unwrap();
        let mut buf = slice.records.clone();
        let mut offsets = Vec::new();
        while let Some((h, _)) = split_next_batch(&mut buf).unwrap() {
            offsets.push(h.base_offset);
        }
        assert_eq!(offsets, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_fetch_at_leo_empty_beyond_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path()).await;
        log.append_leader(client_batch(&[("a", Some("1"))], -1, -1, -1))
            .await
            .unwrap();
        log.advance_hwm(1);
        let shared = log.shared();

        let slice = shared.read(1, 1 << 20, ReadCeiling::HighWatermark).await.unwrap();
        assert!(slice.records.is_empty());
        assert!(shared.read(2, 1 << 20, ReadCeiling::HighWatermark).await.is_err());
    }

    #[tokio::test]
    async fn test_idempotent_duplicate_not_reappended() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path()).await;
        let batch = client_batch(
            &[("a", Some("1")), ("b", Some("2")), ("c", Some("3"))],
            42,
            0,
            5,
        );
        let first = log.append_leader(batch.clone()).await.unwrap();
        assert!(!first.duplicate);
        let leo = log.log_end_offset();

        let second = log.append_leader(batch).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.base_offset, first.base_offset);
        assert_eq!(log.log_end_offset(), leo);
    }

    #[tokio::test]
    async fn test_follower_append_validates_leo() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path()).await;

        let mut raw = client_batch(&[("a", Some("1"))], -1, -1, -1).to_vec();
        stamp_batch(&mut raw, 0, 0);
        log.append_follower(Bytes::from(raw)).await.unwrap();
        assert_eq!(log.log_end_offset(), 1);

        let mut diverged = client_batch(&[("b", Some("2"))], -1, -1, -1).to_vec();
        stamp_batch(&mut diverged, 5, 0);
        assert!(matches!(
            log.append_follower(Bytes::from(diverged)).await,
            Err(StorageError::Divergent { expected: 1, got: 5 })
        ));
    }

    #[tokio::test]
    async fn test_truncate_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path()).await;
        for i in 0..4 {
            log.append_leader(client_batch(&[(&format!("k{i}"), Some("v"))], -1, -1, -1))
                .await
                .unwrap();
        }
        assert_eq!(log.log_end_offset(), 4);

        log.truncate_to(2).await.unwrap();
        assert_eq!(log.log_end_offset(), 2);

        let out = log
            .append_leader(client_batch(&[("new", Some("v"))], -1, -1, -1))
            .await
            .unwrap();
        assert_eq!(out.base_offset, 2);
    }

    #[tokio::test]
    async fn test_recovery_preserves_acked_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open_log(dir.path()).await;
            for i in 0..3 {
                log.append_leader(client_batch(&[(&format!("k{i}"), Some("v"))], -1, -1, -1))
                    .await
                    .unwrap();
            }
            log.advance_hwm(3);
            log.close().await.unwrap();
        }
        let log = open_log(dir.path()).await;
        assert_eq!(log.log_end_offset(), 3);
        assert_eq!(log.high_watermark(), 3);
    }

    #[tokio::test]
    async fn test_segment_roll_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut topic_config = topic_config();
        topic_config.segment_bytes = 256;
        let (mut log, _) = PartitionLog::open(
            dir.path().to_path_buf(),
            TopicPartition::new("orders", 0),
            topic_config,
            storage_config(),
        )
        .await
        .unwrap();

        for i in 0..6 {
            log.append_leader(client_batch(
                &[(&format!("key-{i}"), Some("some-value-payload"))],
                -1,
                -1,
                -1,
            ))
            .await
            .unwrap();
        }
        assert!(log.shared.segments.read().len() > 1);

        // Offsets stay continuous across the roll.
        log.advance_hwm(log.log_end_offset());
        let slice = log
            .shared()
            .read(0, 1 << 20, ReadCeiling::HighWatermark)
            .await
            .unwrap();
        let mut buf = slice.records.clone();
        let mut next = 0;
        while let Some((h, _)) = split_next_batch(&mut buf).unwrap() {
            assert_eq!(h.base_offset, next);
            next = h.next_offset();
        }
        assert_eq!(next, 6);
    }

    #[tokio::test]
    async fn test_delete_records_raises_log_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path()).await;
        for i in 0..5 {
            log.append_leader(client_batch(&[(&format!("k{i}"), Some("v"))], -1, -1, -1))
                .await
                .unwrap();
        }
        log.advance_hwm(5);
        let new_start = log.delete_records(3).await.unwrap();
        assert_eq!(new_start, 3);
        assert!(log.shared().read(0, 1024, ReadCeiling::HighWatermark).await.is_err());
        let slice = log.shared().read(3, 1 << 20, ReadCeiling::HighWatermark).await.unwrap();
        assert!(!slice.records.is_empty());
    }
}
