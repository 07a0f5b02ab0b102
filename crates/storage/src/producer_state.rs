//! Per-partition producer state: idempotence fencing and the transaction
//! index.
//!
//! State is keyed by producer id. Each entry carries the producer epoch,
//! the last appended sequence, and a five-deep window of recent batches so
//! a retried batch can be answered with its original offset instead of a
//! second append. The same bookkeeping tracks open transactions (first
//! offset per producer) and aborted ranges for read-committed fetches.
//!
//! The whole map is journaled as a JSON snapshot named after the log end
//! offset it covers; recovery loads the newest snapshot and replays only
//! the batches appended after it.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use broker_core::limits::PRODUCER_SEQUENCE_WINDOW;
use protocol::records::BatchHeader;
use protocol::ControlMarker;

use crate::error::{Result, StorageError};
use crate::segment::{format_base_offset, SNAPSHOT_EXTENSION};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedBatch {
    pub base_sequence: i32,
    pub last_sequence: i32,
    pub base_offset: i64,
    pub last_offset: i64,
    pub max_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducerState {
    pub epoch: i16,
    pub last_sequence: i32,
    pub recent: VecDeque<CachedBatch>,
    pub last_timestamp_ms: i64,
    /// First offset written by the producer's open transaction, if any.
    pub txn_first_offset: Option<i64>,
}

/// A completed, aborted transaction; consulted by read-committed fetches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbortedTxn {
    pub producer_id: i64,
    pub first_offset: i64,
    pub marker_offset: i64,
}

/// Result of validating an incoming batch against producer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    Accept,
    /// The batch was already appended; respond with the cached result.
    Duplicate {
        base_offset: i64,
        max_timestamp: i64,
    },
}

fn next_sequence(last: i32) -> i32 {
    if last == i32::MAX {
        0
    } else {
        last + 1
    }
}

#[derive(Debug, Default)]
pub struct ProducerStateManager {
    states: HashMap<i64, ProducerState>,
    aborted: Vec<AbortedTxn>,
    /// Log end offset covered by the most recent snapshot on disk.
    snapshot_offset: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    snapshot_offset: i64,
    states: Vec<(i64, ProducerState)>,
    aborted: Vec<AbortedTxn>,
}

impl ProducerStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates an incoming batch. Non-idempotent producers bypass every
    /// check.
    pub fn check_batch(&self, header: &BatchHeader) -> Result<SequenceOutcome> {
        if !header.has_producer_id() {
            return Ok(SequenceOutcome::Accept);
        }
        let state = match self.states.get(&header.producer_id) {
            // First write from this producer on this partition.
            None => return Ok(SequenceOutcome::Accept),
            Some(state) => state,
        };
        if header.producer_epoch < state.epoch {
            return Err(StorageError::FencedEpoch {
                current: state.epoch,
                got: header.producer_epoch,
            });
        }
        if header.producer_epoch > state.epoch {
            // New producer instance; the sequence window resets.
            return Ok(SequenceOutcome::Accept);
        }
        let expected = next_sequence(state.last_sequence);
        if header.base_sequence == expected {
            return Ok(SequenceOutcome::Accept);
        }
        if let Some(cached) = state.recent.iter().find(|c| {
            c.base_sequence == header.base_sequence && c.last_sequence == header.last_sequence()
        }) {
            return Ok(SequenceOutcome::Duplicate {
                base_offset: cached.base_offset,
                max_timestamp: cached.max_timestamp,
            });
        }
        Err(StorageError::OutOfOrderSequence {
            expected,
            got: header.base_sequence,
        })
    }

    /// Records a successfully appended data batch.
    pub fn on_append(&mut self, header: &BatchHeader, now_ms: i64) {
        if !header.has_producer_id() {
            return;
        }
        let state = self
            .states
            .entry(header.producer_id)
            .or_insert_with(|| ProducerState {
                epoch: header.producer_epoch,
                last_sequence: -1,
                recent: VecDeque::new(),
                last_timestamp_ms: now_ms,
                txn_first_offset: None,
            });
        if header.producer_epoch > state.epoch {
            state.epoch = header.producer_epoch;
            state.last_sequence = -1;
            state.recent.clear();
            state.txn_first_offset = None;
        }
        state.last_timestamp_ms = now_ms;
        if header.base_sequence >= 0 {
            state.last_sequence = header.last_sequence();
            state.recent.push_back(CachedBatch {
                base_sequence: header.base_sequence,
                last_sequence: header.last_sequence(),
                base_offset: header.base_offset,
                last_offset: header.last_offset(),
                max_timestamp: header.max_timestamp,
            });
            while state.recent.len() > PRODUCER_SEQUENCE_WINDOW {
                state.recent.pop_front();
            }
        }
        if header.is_transactional() && state.txn_first_offset.is_none() {
            state.txn_first_offset = Some(header.base_offset);
        }
    }

    /// Records an appended control marker, completing the producer's open
    /// transaction on this partition.
    pub fn on_control(&mut self, producer_id: i64, marker: ControlMarker, marker_offset: i64) {
        let first = self
            .states
            .get_mut(&producer_id)
            .and_then(|s| s.txn_first_offset.take());
        if let ControlMarker::Abort { .. } = marker {
            self.aborted.push(AbortedTxn {
                producer_id,
                first_offset: first.unwrap_or(marker_offset),
                marker_offset,
            });
        }
    }

    /// Aborted transactions overlapping `[start, end)`.
    pub fn aborted_in_range(&self, start: i64, end: i64) -> Vec<AbortedTxn> {
        self.aborted
            .iter()
            .filter(|a| a.marker_offset >= start && a.first_offset < end)
            .copied()
            .collect()
    }

    /// Offset of the earliest open transaction, bounding the last stable
    /// offset.
    pub fn earliest_open_txn(&self) -> Option<i64> {
        self.states.values().filter_map(|s| s.txn_first_offset).min()
    }

    pub fn get(&self, producer_id: i64) -> Option<&ProducerState> {
        self.states.get(&producer_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drops producers idle longer than `ttl_ms`. Producers with an open
    /// transaction are never evicted.
    pub fn evict_expired(&mut self, now_ms: i64, ttl_ms: i64) -> usize {
        let before = self.states.len();
        self.states
            .retain(|_, s| s.txn_first_offset.is_some() || now_ms - s.last_timestamp_ms < ttl_ms);
        before - self.states.len()
    }

    /// Drops aborted-transaction entries wholly below the log start offset.
    pub fn evict_aborted_below(&mut self, log_start_offset: i64) {
        self.aborted.retain(|a| a.marker_offset >= log_start_offset);
    }

    pub fn snapshot_offset(&self) -> i64 {
        self.snapshot_offset
    }

    /// Writes a snapshot covering the log up to `log_end_offset`, pruning
    /// all but the two most recent snapshot files.
    pub async fn write_snapshot(&mut self, dir: &Path, log_end_offset: i64) -> Result<()> {
        let file = SnapshotFile {
            snapshot_offset: log_end_offset,
            states: self.states.iter().map(|(k, v)| (*k, v.clone())).collect(),
            aborted: self.aborted.clone(),
        };
        let path = snapshot_path(dir, log_end_offset);
        let json = serde_json::to_vec(&file)
            .map_err(|e| StorageError::corrupt("producer_snapshot", e.to_string()))?;
        tokio::fs::write(&path, json).await?;
        self.snapshot_offset = log_end_offset;
        debug!(offset = log_end_offset, "Wrote producer state snapshot");

        let mut offsets = list_snapshot_offsets(dir).await?;
        offsets.sort_unstable();
        while offsets.len() > 2 {
            let old = offsets.remove(0);
            let _ = tokio::fs::remove_file(snapshot_path(dir, old)).await;
        }
        Ok(())
    }

    /// Loads the newest snapshot in `dir`, if any. Batches at or after the
    /// returned snapshot offset must be replayed by the caller.
    pub async fn load_latest(dir: &Path) -> Result<Self> {
        let mut offsets = list_snapshot_offsets(dir).await?;
        offsets.sort_unstable();
        let Some(&offset) = offsets.last() else {
            return Ok(Self::new());
        };
        let bytes = tokio::fs::read(snapshot_path(dir, offset)).await?;
        let file: SnapshotFile = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::corrupt("producer_snapshot", e.to_string()))?;
        Ok(Self {
            states: file.states.into_iter().collect(),
            aborted: file.aborted,
            snapshot_offset: file.snapshot_offset,
        })
    }
}

fn snapshot_path(dir: &Path, offset: i64) -> PathBuf {
    dir.join(format!(
        "{}.{SNAPSHOT_EXTENSION}",
        format_base_offset(offset)
    ))
}

async fn list_snapshot_offsets(dir: &Path) -> Result<Vec<i64>> {
    let mut offsets = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(&format!(".{SNAPSHOT_EXTENSION}")) {
            if let Ok(offset) = stem.parse::<i64>() {
                offsets.push(offset);
            }
        }
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use protocol::records::stamp_batch;
    use protocol::{Record, RecordBatch};

    fn header(pid: i64, epoch: i16, base_seq: i32, base_offset: i64, count: usize) -> BatchHeader {
        let records = (0..count)
            .map(|_| Record::new(None, Some(Bytes::from_static(b"v"))))
            .collect();
        let mut raw = RecordBatch::build(1000, pid, epoch, base_seq, records)
            .encode()
            .to_vec();
        stamp_batch(&mut raw, base_offset, 0);
        BatchHeader::parse(&raw).unwrap()
    }

    #[test]
    fn test_in_order_sequences_accepted() {
        let mut mgr = ProducerStateManager::new();
        let h = header(42, 0, 0, 10, 3);
        assert_eq!(mgr.check_batch(&h).unwrap(), SequenceOutcome::Accept);
        mgr.on_append(&h, 0);

        let h = header(42, 0, 3, 13, 2);
        assert_eq!(mgr.check_batch(&h).unwrap(), SequenceOutcome::Accept);
    }

    #[test]
    fn test_duplicate_returns_cached_offset() {
        let mut mgr = ProducerStateManager::new();
        let h = header(42, 0, 5, 10, 3);
        mgr.on_append(&h, 0);
        match mgr.check_batch(&header(42, 0, 5, 0, 3)).unwrap() {
            SequenceOutcome::Duplicate { base_offset, .. } => assert_eq!(base_offset, 10),
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[test]
    fn test_gap_is_out_of_order() {
        let mut mgr = ProducerStateManager::new();
        mgr.on_append(&header(42, 0, 0, 0, 1), 0);
        assert!(matches!(
            mgr.check_batch(&header(42, 0, 5, 0, 1)),
            Err(StorageError::OutOfOrderSequence { expected: 1, got: 5 })
        ));
    }

    #[test]
    fn test_stale_epoch_fenced() {
        let mut mgr = ProducerStateManager::new();
        mgr.on_append(&header(42, 3, 0, 0, 1), 0);
        assert!(matches!(
            mgr.check_batch(&header(42, 2, 1, 0, 1)),
            Err(StorageError::FencedEpoch { current: 3, got: 2 })
        ));
        // A newer epoch resets the window.
        assert_eq!(
            mgr.check_batch(&header(42, 4, 0, 0, 1)).unwrap(),
            SequenceOutcome::Accept
        );
    }

    #[test]
    fn test_window_bounded_to_five() {
        let mut mgr = ProducerStateManager::new();
        for i in 0..8 {
            mgr.on_append(&header(42, 0, i, i as i64, 1), 0);
        }
        let state = mgr.get(42).unwrap();
        assert_eq!(state.recent.len(), PRODUCER_SEQUENCE_WINDOW);
        // The oldest cached batch is sequence 3 now; 0 is out of order.
        assert!(mgr.check_batch(&header(42, 0, 0, 0, 1)).is_err());
    }

    #[test]
    fn test_txn_tracking() {
        let mut mgr = ProducerStateManager::new();
        let mut h = header(7, 0, 0, 100, 2);
        h.attributes |= 1 << 4; // transactional
        mgr.on_append(&h, 0);
        assert_eq!(mgr.earliest_open_txn(), Some(100));

        mgr.on_control(7, ControlMarker::Abort { coordinator_epoch: 0 }, 102);
        assert_eq!(mgr.earliest_open_txn(), None);
        let aborted = mgr.aborted_in_range(0, 200);
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].first_offset, 100);
        assert!(mgr.aborted_in_range(103, 200).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = ProducerStateManager::new();
        mgr.on_append(&header(42, 1, 0, 5, 2), 99);
        mgr.write_snapshot(dir.path(), 7).await.unwrap();

        let loaded = ProducerStateManager::load_latest(dir.path()).await.unwrap();
        assert_eq!(loaded.snapshot_offset(), 7);
        assert_eq!(loaded.get(42).unwrap().last_sequence, 1);
    }
}
