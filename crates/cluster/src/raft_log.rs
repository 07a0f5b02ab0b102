//! Persisted consensus state: the command log, the stable term/vote, and
//! the state-machine snapshot.
//!
//! The log is JSON-lines (one entry per line) under `<data-dir>/raft/`;
//! a trailing partial line from a crash is dropped on load. The stable
//! state is rewritten on every term/vote change, before any message that
//! depends on it is sent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::command::Command;
use crate::error::{ClusterError, Result};
use crate::state::MetadataState;

const LOG_FILE: &str = "log";
const STABLE_FILE: &str = "stable.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StableState {
    pub current_term: u64,
    pub voted_for: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub state: MetadataState,
}

/// The on-disk consensus log plus its in-memory tail.
pub struct RaftLog {
    dir: PathBuf,
    /// Entries after the snapshot, ascending by index.
    entries: Vec<LogEntry>,
    /// Index of the first entry in `entries` (snapshot.last_index + 1).
    first_index: u64,
    /// Term at `first_index - 1` (snapshot.last_term).
    prev_term: u64,
    file: tokio::fs::File,
}

impl RaftLog {
    pub async fn open(dir: &Path) -> Result<(Self, StableState, Option<Snapshot>)> {
        tokio::fs::create_dir_all(dir).await?;

        let stable: StableState = match tokio::fs::read(dir.join(STABLE_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ClusterError::Corrupt(format!("stable state: {e}")))?,
            Err(_) => StableState::default(),
        };
        let snapshot: Option<Snapshot> = match tokio::fs::read(dir.join(SNAPSHOT_FILE)).await {
            Ok(bytes) => Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| ClusterError::Corrupt(format!("snapshot: {e}")))?,
            ),
            Err(_) => None,
        };
        let (first_index, prev_term) = snapshot
            .as_ref()
            .map(|s| (s.last_index + 1, s.last_term))
            .unwrap_or((1, 0));

        let mut entries = Vec::new();
        if let Ok(raw) = tokio::fs::read_to_string(dir.join(LOG_FILE)).await {
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogEntry>(line) {
                    Ok(entry) => {
                        if entry.index >= first_index {
                            entries.push(entry);
                        }
                    }
                    Err(err) => {
                        // A torn tail write; everything before it is intact.
                        warn!(error = %err, "Dropping partial consensus log line");
                        break;
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await?;
        debug!(
            entries = entries.len(),
            first_index,
            "Opened consensus log"
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                entries,
                first_index,
                prev_term,
                file,
            },
            stable,
            snapshot,
        ))
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.first_index - 1)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(self.prev_term)
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Term of the entry at `index`; `None` if it is not in the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.first_index - 1 {
            return Some(self.prev_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        if index < self.first_index {
            return self.entries.clone();
        }
        let start = (index - self.first_index) as usize;
        self.entries.get(start..).unwrap_or(&[]).to_vec()
    }

    /// Appends entries and fsyncs them before returning.
    pub async fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(
                &serde_json::to_string(entry)
                    .map_err(|e| ClusterError::Corrupt(e.to_string()))?,
            );
            buf.push('\n');
        }
        self.file.write_all(buf.as_bytes()).await?;
        self.file.sync_data().await?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Removes entries at and above `index` (conflict resolution).
    pub async fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index <= self.first_index - 1 {
            self.entries.clear();
        } else {
            self.entries
                .truncate((index - self.first_index) as usize);
        }
        self.rewrite().await
    }

    /// Drops entries covered by `snapshot` and persists it.
    pub async fn compact_to(&mut self, snapshot: &Snapshot) -> Result<()> {
        save_snapshot(&self.dir, snapshot).await?;
        let keep_from = snapshot.last_index + 1;
        self.entries.retain(|e| e.index >= keep_from);
        self.first_index = keep_from;
        self.prev_term = snapshot.last_term;
        self.rewrite().await
    }

    async fn rewrite(&mut self) -> Result<()> {
        let mut buf = String::new();
        for entry in &self.entries {
            buf.push_str(
                &serde_json::to_string(entry)
                    .map_err(|e| ClusterError::Corrupt(e.to_string()))?,
            );
            buf.push('\n');
        }
        let path = self.dir.join(LOG_FILE);
        tokio::fs::write(&path, buf).await?;
        self.file = OpenOptions::new().create(true).append(true).open(&path).await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

pub async fn save_stable(dir: &Path, stable: &StableState) -> Result<()> {
    let json = serde_json::to_vec(stable).map_err(|e| ClusterError::Corrupt(e.to_string()))?;
    tokio::fs::write(dir.join(STABLE_FILE), json).await?;
    Ok(())
}

pub async fn save_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let json = serde_json::to_vec(snapshot).map_err(|e| ClusterError::Corrupt(e.to_string()))?;
    tokio::fs::write(dir.join(SNAPSHOT_FILE), json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: Command::Noop,
        }
    }

    #[tokio::test]
    async fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, _, _) = RaftLog::open(dir.path()).await.unwrap();
            log.append(&[entry(1, 1), entry(1, 2), entry(2, 3)])
                .await
                .unwrap();
            assert_eq!(log.last_index(), 3);
            assert_eq!(log.last_term(), 2);
        }
        let (log, _, _) = RaftLog::open(dir.path()).await.unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(0), Some(0));
    }

    #[tokio::test]
    async fn test_truncate_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _, _) = RaftLog::open(dir.path()).await.unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)])
            .await
            .unwrap();
        log.truncate_from(2).await.unwrap();
        assert_eq!(log.last_index(), 1);
        log.append(&[entry(2, 2)]).await.unwrap();
        assert_eq!(log.last_term(), 2);
    }

    #[tokio::test]
    async fn test_compaction_moves_first_index() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _, _) = RaftLog::open(dir.path()).await.unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)])
            .await
            .unwrap();
        let snapshot = Snapshot {
            last_index: 2,
            last_term: 1,
            state: MetadataState::new(),
        };
        log.compact_to(&snapshot).await.unwrap();
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.term_at(2), Some(1));
        assert!(log.get(1).is_none());
        assert_eq!(log.last_index(), 3);

        let (log, _, loaded) = RaftLog::open(dir.path()).await.unwrap();
        assert_eq!(loaded.unwrap().last_index, 2);
        assert_eq!(log.last_index(), 3);
    }

    #[tokio::test]
    async fn test_partial_tail_line_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, _, _) = RaftLog::open(dir.path()).await.unwrap();
            log.append(&[entry(1, 1)]).await.unwrap();
        }
        // Simulate a torn write.
        let path = dir.path().join(LOG_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"{\"term\":1,\"ind");
        std::fs::write(&path, raw).unwrap();

        let (log, _, _) = RaftLog::open(dir.path()).await.unwrap();
        assert_eq!(log.last_index(), 1);
    }
}
