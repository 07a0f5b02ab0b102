//! Log compaction for `cleanup.policy=compact` topics.
//!
//! A pass scans the sealed segments, builds a key -> latest-offset map,
//! and rewrites them as one merged segment keeping only each key's newest
//! record. Offsets are preserved exactly, so compacted topics are the one
//! place non-dense offsets appear. Tombstones (null value) survive the
//! pass that first sees them and are dropped once `delete.retention.ms`
//! has elapsed since then. Control batches and compressed batches are
//! carried through untouched; the active segment is never cleaned.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use protocol::records::split_next_batch;
use protocol::{Record, RecordBatch};

use crate::error::Result;
use crate::index::{OffsetIndex, OffsetIndexEntry, TimeIndex, TimeIndexEntry};
use crate::log::{remove_segment_files, PartitionLog};
use crate::segment::{segment_path, SegmentShared, INDEX_EXTENSION, LOG_EXTENSION, TIME_INDEX_EXTENSION};

/// Runs one compaction pass over the sealed segments. Returns the number
/// of records dropped.
pub(crate) async fn compact_once(log: &mut PartitionLog, now_ms: i64) -> Result<usize> {
    let active_base = log.active_base();
    let sealed: Vec<Arc<SegmentShared>> = {
        let map = log.shared_ref().segments();
        map.values()
            .filter(|s| s.base_offset != active_base)
            .cloned()
            .collect()
    };
    if sealed.is_empty() {
        return Ok(0);
    }

    // Pass 1: latest offset per key across every sealed segment.
    let mut latest: HashMap<Bytes, i64> = HashMap::new();
    let mut raw_segments: Vec<(Arc<SegmentShared>, Bytes)> = Vec::with_capacity(sealed.len());
    for segment in &sealed {
        let raw = segment
            .read_from(segment.base_offset, i64::MAX, usize::MAX)
            .await?;
        let mut buf = raw.clone();
        while let Some((header, batch_raw)) = split_next_batch(&mut buf)? {
            if header.is_control() || header.compression_codec() != 0 {
                continue;
            }
            let batch = match RecordBatch::decode(&mut batch_raw.clone()) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(
                        segment = segment.base_offset,
                        error = %err,
                        "Skipping undecodable batch during compaction"
                    );
                    continue;
                }
            };
            for record in &batch.records {
                if let Some(key) = &record.key {
                    latest.insert(key.clone(), batch.base_offset + record.offset_delta as i64);
                }
            }
        }
        raw_segments.push((segment.clone(), raw));
    }

    // Pass 2: rewrite surviving batches into one merged segment.
    let merged_base = sealed.first().unwrap().base_offset;
    let merged_end = sealed.last().unwrap().next_offset();
    let delete_retention_ms = log.delete_retention_ms();

    let mut cleaned = Vec::new();
    let mut offset_index = OffsetIndex::new();
    let mut time_index = TimeIndex::new();
    let mut max_timestamp = -1i64;
    let mut dropped = 0usize;

    for (_, raw) in &raw_segments {
        let mut buf = raw.clone();
        while let Some((header, batch_raw)) = split_next_batch(&mut buf)? {
            let out_batch: Option<Bytes> =
                if header.is_control() || header.compression_codec() != 0 {
                    Some(batch_raw.clone())
                } else {
                    match RecordBatch::decode(&mut batch_raw.clone()) {
                        // Undecodable batches were warned about in pass 1;
                        // carry them through untouched.
                        Err(_) => Some(batch_raw.clone()),
                        Ok(batch) => rebuild_batch(
                            log,
                            batch,
                            &latest,
                            now_ms,
                            delete_retention_ms,
                            &mut dropped,
                        ),
                    }
                };
            if let Some(bytes) = out_batch {
                let header = protocol::records::BatchHeader::parse(&bytes)?;
                if !cleaned.is_empty() {
                    offset_index.push(OffsetIndexEntry {
                        relative_offset: (header.base_offset - merged_base) as u32,
                        position: cleaned.len() as u32,
                    });
                }
                max_timestamp = max_timestamp.max(header.max_timestamp);
                if max_timestamp >= 0 {
                    time_index.push(TimeIndexEntry {
                        timestamp: max_timestamp,
                        relative_offset: (header.last_offset() - merged_base) as u32,
                    });
                }
                cleaned.extend_from_slice(&bytes);
            }
        }
    }

    if dropped == 0 && sealed.len() == 1 {
        // Nothing to gain; leave the segment alone.
        return Ok(0);
    }

    // Swap: write the cleaned files, drop the merged segments, publish the
    // replacement.
    let dir = log.dir().to_path_buf();
    let cleaned_log = dir.join(format!(
        "{}.{LOG_EXTENSION}.cleaned",
        crate::segment::format_base_offset(merged_base)
    ));
    tokio::fs::write(&cleaned_log, &cleaned).await?;

    {
        let shared = log.shared_ref();
        let mut map = shared.segments_mut();
        for segment in &sealed {
            map.remove(&segment.base_offset);
        }
    }
    for segment in &sealed {
        remove_segment_files(&dir, segment.base_offset).await;
    }

    let final_log = segment_path(&dir, merged_base, LOG_EXTENSION);
    tokio::fs::rename(&cleaned_log, &final_log).await?;
    tokio::fs::write(
        segment_path(&dir, merged_base, INDEX_EXTENSION),
        crate::segment::index_bytes(&offset_index),
    )
    .await?;
    tokio::fs::write(
        segment_path(&dir, merged_base, TIME_INDEX_EXTENSION),
        crate::segment::time_index_bytes(&time_index),
    )
    .await?;

    let replacement = Arc::new(SegmentShared::for_compacted(
        merged_base,
        final_log,
        cleaned.len() as u64,
        merged_end,
        max_timestamp,
        offset_index,
        time_index,
    ));
    log.shared_ref()
        .segments_mut()
        .insert(merged_base, replacement);

    debug!(
        partition_base = merged_base,
        dropped,
        cleaned_bytes = cleaned.len(),
        "Compaction pass complete"
    );
    Ok(dropped)
}

/// Filters one data batch against the survivor map, preserving absolute
/// offsets. Returns `None` when no record survives.
fn rebuild_batch(
    log: &mut PartitionLog,
    batch: RecordBatch,
    latest: &HashMap<Bytes, i64>,
    now_ms: i64,
    delete_retention_ms: i64,
    dropped: &mut usize,
) -> Option<Bytes> {
    let mut survivors: Vec<Record> = Vec::new();
    let mut first_abs = None;
    let mut last_abs = 0i64;

    for record in batch.records {
        let abs = batch.base_offset + record.offset_delta as i64;
        let survives = match &record.key {
            None => true,
            Some(key) => match latest.get(key) {
                Some(&newest) if newest == abs => {
                    if record.value.is_none() {
                        // Tombstone: held for the grace period after the
                        // pass that first preserved it.
                        let horizons = log.tombstone_horizons();
                        match horizons.get(&abs) {
                            Some(&deadline) if now_ms >= deadline => {
                                horizons.remove(&abs);
                                false
                            }
                            Some(_) => true,
                            None => {
                                horizons.insert(abs, now_ms + delete_retention_ms);
                                true
                            }
                        }
                    } else {
                        true
                    }
                }
                _ => false,
            },
        };
        if survives {
            first_abs.get_or_insert(abs);
            last_abs = abs;
            survivors.push(record);
        } else {
            *dropped += 1;
            log.tombstone_horizons().remove(&abs);
        }
    }

    let first_abs = first_abs?;
    let mut records = survivors;
    for record in &mut records {
        let abs = batch.base_offset + record.offset_delta as i64;
        record.offset_delta = (abs - first_abs) as i32;
    }
    let rebuilt = RecordBatch {
        base_offset: first_abs,
        partition_leader_epoch: batch.partition_leader_epoch,
        attributes: batch.attributes,
        last_offset_delta: (last_abs - first_abs) as i32,
        first_timestamp: batch.first_timestamp,
        max_timestamp: batch.max_timestamp,
        producer_id: batch.producer_id,
        producer_epoch: batch.producer_epoch,
        base_sequence: batch.base_sequence,
        records,
    };
    Some(rebuilt.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::{CleanupPolicy, StorageConfig, TopicConfig, TopicPartition};
    use crate::log::ReadCeiling;

    fn record_batch(key: &str, value: Option<&str>) -> Bytes {
        let record = Record::new(
            Some(Bytes::copy_from_slice(key.as_bytes())),
            value.map(|v| Bytes::copy_from_slice(v.as_bytes())),
        );
        RecordBatch::build(1_700_000_000_000, -1, -1, -1, vec![record]).encode()
    }

    async fn compacted_log(dir: &std::path::Path) -> PartitionLog {
        let storage = StorageConfig::default();
        let mut topic = TopicConfig::from_storage(&storage);
        topic.cleanup_policy = CleanupPolicy::Compact;
        topic.delete_retention_ms = 0;
        let (log, _) = PartitionLog::open(
            dir.to_path_buf(),
            TopicPartition::new("compacted", 0),
            topic,
            std::sync::Arc::new(storage),
        )
        .await
        .unwrap();
        log
    }

    #[tokio::test]
    async fn test_latest_record_per_key_survives() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = compacted_log(dir.path()).await;

        for (key, value) in [("A", Some("1")), ("B", Some("1")), ("A", Some("2")), ("A", None)] {
            log.append_leader(record_batch(key, value)).await.unwrap();
            log.roll().await.unwrap();
        }
        log.advance_hwm(4);

        let now = chrono::Utc::now().timestamp_millis();
        // First pass drops the shadowed A records; the tombstone survives
        // its grace period.
        let dropped = compact_once(&mut log, now).await.unwrap();
        assert_eq!(dropped, 2);

        // Second pass is past the (zero) grace period: the tombstone goes.
        let dropped = compact_once(&mut log, now + 1).await.unwrap();
        assert_eq!(dropped, 1);

        let slice = log
            .shared()
            .read(0, 1 << 20, ReadCeiling::HighWatermark)
            .await
            .unwrap();
        let mut buf = slice.records.clone();
        let mut offsets = Vec::new();
        while let Some((header, raw)) = split_next_batch(&mut buf).unwrap() {
            let batch = RecordBatch::decode(&mut raw.clone()).unwrap();
            for record in &batch.records {
                offsets.push(header.base_offset + record.offset_delta as i64);
                assert_eq!(record.key.as_deref(), Some(b"B".as_slice()));
            }
        }
        // Fetching from 0 skips the compacted-away offsets.
        assert_eq!(offsets, vec![1]);
        // Offsets and LEO are untouched by compaction.
        assert_eq!(log.log_end_offset(), 4);
    }

    #[tokio::test]
    async fn test_offsets_preserved_across_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = compacted_log(dir.path()).await;

        for (key, value) in [("k1", Some("a")), ("k2", Some("b")), ("k1", Some("c"))] {
            log.append_leader(record_batch(key, value)).await.unwrap();
            log.roll().await.unwrap();
        }
        log.advance_hwm(3);
        compact_once(&mut log, chrono::Utc::now().timestamp_millis())
            .await
            .unwrap();

        let slice = log
            .shared()
            .read(0, 1 << 20, ReadCeiling::HighWatermark)
            .await
            .unwrap();
        let mut buf = slice.records.clone();
        let mut found = Vec::new();
        while let Some((header, raw)) = split_next_batch(&mut buf).unwrap() {
            let batch = RecordBatch::decode(&mut raw.clone()).unwrap();
            for record in &batch.records {
                found.push((
                    header.base_offset + record.offset_delta as i64,
                    record.key.clone().unwrap(),
                ));
            }
        }
        assert_eq!(
            found,
            vec![
                (1, Bytes::from_static(b"k2")),
                (2, Bytes::from_static(b"k1")),
            ]
        );
    }
}
