//! Checkpoint records
//!
//! Each rank snapshots its local queue to `<dir>/circle<rank>.txt`.
//!
//! Record layout (bincode, fixed-width little-endian integers):
//!
//! ```text
//! ┌──────────┬─────────┬──────┬──────────┬────────────┬──────────────────────┐
//! │ CIRCLECK │ version │ rank │ sequence │ created_at │ items (len-prefixed) │
//! │ 8 bytes  │ u32     │ u64  │ u64      │ RFC 3339   │ u64 count, then each │
//! │          │         │      │          │ string     │ item as u64 + bytes  │
//! └──────────┴─────────┴──────┴──────────┴────────────┴──────────────────────┘
//! ```
//!
//! Writes go to a hidden temp file in the same directory which is then
//! renamed over the record, so a reader sees either the old record or the
//! new one, never a mix.

use crate::config::MissingRestart;
use crate::engine::queue::{LocalQueue, WorkItem};
use crate::error::{CheckpointError, CheckpointResult, RestartError, RestartResult};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Leading bytes of every record
pub const RECORD_MAGIC: [u8; 8] = *b"CIRCLECK";

/// Current record format version
pub const RECORD_VERSION: u32 = 1;

static RECORD_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^circle(\d+)\.txt$").expect("Invalid record name regex"));

/// Borrowing view used for encoding, so items are not copied
#[derive(Serialize)]
struct RecordOut<'a> {
    magic: [u8; 8],
    version: u32,
    rank: u64,
    sequence: u64,
    created_at: String,
    items: Vec<&'a [u8]>,
}

#[derive(Deserialize)]
struct RecordIn {
    magic: [u8; 8],
    version: u32,
    rank: u64,
    sequence: u64,
    created_at: String,
    items: Vec<Vec<u8>>,
}

/// A decoded checkpoint record
#[derive(Debug)]
pub struct CheckpointRecord {
    /// Rank that wrote the record
    pub rank: usize,

    /// Write sequence number
    pub sequence: u64,

    /// When the record was written
    pub created_at: DateTime<Utc>,

    /// Queued items, far end first
    pub items: Vec<WorkItem>,
}

/// Result of a successful checkpoint write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Rank that wrote the record
    pub rank: usize,

    /// Record location
    pub path: PathBuf,

    /// Sequence number written
    pub sequence: u64,

    /// Items in the record
    pub items: usize,

    /// Record size in bytes
    pub bytes: u64,
}

/// Path of a rank's record
pub fn record_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("circle{}.txt", rank))
}

/// Writes checkpoint records for one rank
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    rank: usize,

    /// Last sequence written or found on disk; `None` until looked up
    last_sequence: Option<u64>,
}

impl CheckpointManager {
    /// Manager for `rank`, writing into `dir`
    pub fn new(dir: impl Into<PathBuf>, rank: usize) -> Self {
        Self {
            dir: dir.into(),
            rank,
            last_sequence: None,
        }
    }

    /// Continue numbering after a record already loaded for this rank
    pub fn resume_after(mut self, sequence: u64) -> Self {
        self.last_sequence = Some(sequence);
        self
    }

    /// Path this manager writes to
    pub fn path(&self) -> PathBuf {
        record_path(&self.dir, self.rank)
    }

    fn next_sequence(&mut self) -> u64 {
        let last = *self.last_sequence.get_or_insert_with(|| {
            // An unreadable previous record just restarts the numbering
            peek_sequence(&record_path(&self.dir, self.rank)).unwrap_or(0)
        });
        last + 1
    }

    /// Snapshot the queue to disk, atomically replacing any previous record
    pub fn write(&mut self, queue: &LocalQueue) -> CheckpointResult<CheckpointSummary> {
        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let sequence = self.next_sequence();
        let record = RecordOut {
            magic: RECORD_MAGIC,
            version: RECORD_VERSION,
            rank: self.rank as u64,
            sequence,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            items: queue.iter().map(|item| item.as_bytes()).collect(),
        };

        let bytes = bincode::serialize(&record).map_err(|e| CheckpointError::Encode {
            rank: self.rank,
            reason: e.to_string(),
        })?;

        let path = self.path();
        let tmp = self.dir.join(format!(".circle{}.txt.tmp", self.rank));
        write_synced(&tmp, &bytes).map_err(|source| CheckpointError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| CheckpointError::Write {
            path: path.clone(),
            source,
        })?;

        self.last_sequence = Some(sequence);
        info!(
            rank = self.rank,
            sequence,
            items = record.items.len(),
            path = %path.display(),
            "Checkpoint written"
        );

        Ok(CheckpointSummary {
            rank: self.rank,
            path,
            sequence,
            items: record.items.len(),
            bytes: bytes.len() as u64,
        })
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn peek_sequence(path: &Path) -> Option<u64> {
    let bytes = fs::read(path).ok()?;
    let record: RecordIn = bincode::deserialize(&bytes).ok()?;
    (record.magic == RECORD_MAGIC).then_some(record.sequence)
}

/// Decode and validate one record
pub fn read_record(path: &Path, max_item_len: usize) -> RestartResult<CheckpointRecord> {
    let malformed = |reason: String| RestartError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).map_err(|source| RestartError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let record: RecordIn = bincode::deserialize(&bytes).map_err(|e| malformed(e.to_string()))?;

    if record.magic != RECORD_MAGIC {
        return Err(malformed("bad magic".into()));
    }
    if record.version != RECORD_VERSION {
        return Err(malformed(format!(
            "unsupported format version {}",
            record.version
        )));
    }

    let created_at = DateTime::parse_from_rfc3339(&record.created_at)
        .map_err(|e| malformed(format!("bad timestamp: {}", e)))?
        .with_timezone(&Utc);

    let items = record
        .items
        .into_iter()
        .map(|bytes| WorkItem::new(bytes, max_item_len))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| malformed(e.to_string()))?;

    Ok(CheckpointRecord {
        rank: record.rank as usize,
        sequence: record.sequence,
        created_at,
        items,
    })
}

/// Find every record in `dir`, sorted by rank
pub fn list_records(dir: &Path) -> RestartResult<Vec<(usize, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(RestartError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| RestartError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(caps) = name.to_str().and_then(|n| RECORD_NAME_REGEX.captures(n)) else {
            continue;
        };
        // Names with absurd rank numbers are not ours
        if let Ok(rank) = caps[1].parse::<usize>() {
            records.push((rank, entry.path()));
        }
    }

    records.sort();
    Ok(records)
}

/// Load the records of a run with `ranks` ranks
///
/// Returns one entry per rank; `None` only for ranks allowed to start empty.
pub fn load_restarts(
    dir: &Path,
    ranks: usize,
    max_item_len: usize,
    missing: MissingRestart,
) -> RestartResult<Vec<Option<CheckpointRecord>>> {
    if let Some((rank, path)) = list_records(dir)?.into_iter().find(|(r, _)| *r >= ranks) {
        return Err(RestartError::UnexpectedRank { path, rank, ranks });
    }

    let mut loaded = Vec::with_capacity(ranks);
    for rank in 0..ranks {
        let path = record_path(dir, rank);
        if !path.exists() {
            match missing {
                MissingRestart::Fail => return Err(RestartError::Missing { rank, path }),
                MissingRestart::StartEmpty => {
                    warn!(rank, path = %path.display(), "No restart record, starting empty");
                    loaded.push(None);
                    continue;
                }
            }
        }

        let record = read_record(&path, max_item_len)?;
        if record.rank != rank {
            return Err(RestartError::RankMismatch {
                path,
                expected: rank,
                found: record.rank,
            });
        }

        debug!(
            rank,
            sequence = record.sequence,
            items = record.items.len(),
            created_at = %record.created_at,
            "Restart record loaded"
        );
        loaded.push(Some(record));
    }

    Ok(loaded)
}

/// Delete the records of ranks `0..ranks`
pub fn remove_records(dir: &Path, ranks: usize) {
    for rank in 0..ranks {
        let path = record_path(dir, rank);
        match fs::remove_file(&path) {
            Ok(()) => debug!(rank, path = %path.display(), "Restart record removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(rank, path = %path.display(), error = %e, "Failed to remove restart record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue_of(items: &[&str]) -> LocalQueue {
        let mut queue = LocalQueue::new(64);
        for item in items {
            queue.enqueue(item.as_bytes()).unwrap();
        }
        queue
    }

    fn strings(record: &CheckpointRecord) -> Vec<&str> {
        record.items.iter().map(|i| i.as_str().unwrap()).collect()
    }

    #[test]
    fn test_write_and_read_record() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path(), 2);

        let summary = manager.write(&queue_of(&["a", "bb", "ccc"])).unwrap();
        assert_eq!(summary.path, dir.path().join("circle2.txt"));
        assert_eq!(summary.sequence, 1);
        assert_eq!(summary.items, 3);

        let record = read_record(&summary.path, 64).unwrap();
        assert_eq!(record.rank, 2);
        assert_eq!(strings(&record), vec!["a", "bb", "ccc"]);

        // No temp file left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_sequence_continues_from_existing_record() {
        let dir = tempdir().unwrap();
        CheckpointManager::new(dir.path(), 0)
            .write(&queue_of(&["x"]))
            .unwrap();

        let mut manager = CheckpointManager::new(dir.path(), 0);
        assert_eq!(manager.write(&queue_of(&[])).unwrap().sequence, 2);
        assert_eq!(manager.write(&queue_of(&["y"])).unwrap().sequence, 3);

        let mut resumed = CheckpointManager::new(dir.path(), 0).resume_after(10);
        assert_eq!(resumed.write(&queue_of(&[])).unwrap().sequence, 11);
    }

    #[test]
    fn test_malformed_record() {
        let dir = tempdir().unwrap();
        let path = record_path(dir.path(), 0);

        fs::write(&path, b"not a record").unwrap();
        assert!(matches!(
            read_record(&path, 64),
            Err(RestartError::Malformed { .. })
        ));

        // Truncated record
        CheckpointManager::new(dir.path(), 0)
            .write(&queue_of(&["abc", "def"]))
            .unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert!(matches!(
            read_record(&path, 64),
            Err(RestartError::Malformed { .. })
        ));
    }

    #[test]
    fn test_item_too_long_for_current_limit() {
        let dir = tempdir().unwrap();
        let summary = CheckpointManager::new(dir.path(), 0)
            .write(&queue_of(&["0123456789"]))
            .unwrap();
        assert!(matches!(
            read_record(&summary.path, 4),
            Err(RestartError::Malformed { .. })
        ));
    }

    #[test]
    fn test_load_restarts() {
        let dir = tempdir().unwrap();
        CheckpointManager::new(dir.path(), 0)
            .write(&queue_of(&["a"]))
            .unwrap();

        assert!(matches!(
            load_restarts(dir.path(), 2, 64, MissingRestart::Fail),
            Err(RestartError::Missing { rank: 1, .. })
        ));

        let loaded = load_restarts(dir.path(), 2, 64, MissingRestart::StartEmpty).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(strings(loaded[0].as_ref().unwrap()), vec!["a"]);
        assert!(loaded[1].is_none());
    }

    #[test]
    fn test_load_restarts_rejects_extra_and_mismatched_ranks() {
        let dir = tempdir().unwrap();
        for rank in 0..3 {
            CheckpointManager::new(dir.path(), rank)
                .write(&queue_of(&[]))
                .unwrap();
        }
        assert!(matches!(
            load_restarts(dir.path(), 2, 64, MissingRestart::Fail),
            Err(RestartError::UnexpectedRank { rank: 2, ranks: 2, .. })
        ));

        fs::rename(record_path(dir.path(), 2), record_path(dir.path(), 1)).unwrap();
        assert!(matches!(
            load_restarts(dir.path(), 3, 64, MissingRestart::StartEmpty),
            Err(RestartError::RankMismatch {
                expected: 1,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_list_and_remove_records() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("circle10.txt"), b"").unwrap();
        fs::write(dir.path().join("circle2.txt"), b"").unwrap();
        fs::write(dir.path().join("circle.txt"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let ranks: Vec<usize> = list_records(dir.path())
            .unwrap()
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        assert_eq!(ranks, vec![2, 10]);

        remove_records(dir.path(), 11);
        assert!(list_records(dir.path()).unwrap().is_empty());
        assert!(dir.path().join("notes.txt").exists());

        assert!(list_records(&dir.path().join("missing")).unwrap().is_empty());
    }
}
