//! Parallel local directory walk
//!
//! Each work item is one directory path. Processing a directory counts its
//! files and bytes and enqueues its subdirectories, so the tree fans out
//! across ranks through stealing.

use crate::config::WalkOptions;
use crate::engine::{current_rank, Circle, Handle};
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Totals collected by the walk callbacks
#[derive(Debug, Default)]
pub struct WalkStats {
    /// Directories read
    pub dirs: AtomicU64,

    /// Non-directory entries found
    pub files: AtomicU64,

    /// Sum of file sizes
    pub bytes: AtomicU64,

    /// Directories or entries that could not be read
    pub errors: AtomicU64,

    /// Directories skipped by depth or exclusion
    pub skipped: AtomicU64,
}

impl WalkStats {
    fn record_dir(&self) {
        self.dirs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_file(&self, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Register walk callbacks on `circle`
pub fn install(circle: &mut Circle, options: WalkOptions) -> Arc<WalkStats> {
    let stats = Arc::new(WalkStats::default());
    let options = Arc::new(options);

    let root = options.root.clone();
    circle.on_create(move |h: &mut dyn Handle| {
        if !h.enqueue(root.as_os_str().as_bytes()) {
            warn!(path = %root.display(), "Root path rejected");
        }
    });

    let walk_stats = Arc::clone(&stats);
    circle.on_process(move |h: &mut dyn Handle| {
        if let Some(item) = h.dequeue() {
            let dir = Path::new(OsStr::from_bytes(item.as_bytes()));
            process_directory(dir, &options, h, &walk_stats);
        }
    });

    stats
}

fn depth_of(dir: &Path, root: &Path) -> usize {
    dir.strip_prefix(root)
        .map(|rel| rel.components().count())
        .unwrap_or(0)
}

/// Read one directory, enqueueing subdirectories
fn process_directory(dir: &Path, options: &WalkOptions, h: &mut dyn Handle, stats: &WalkStats) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(rank = ?current_rank(), path = %dir.display(), error = %e, "Cannot read directory");
            stats.record_error();
            return;
        }
    };
    stats.record_dir();

    let child_depth = depth_of(dir, &options.root) + 1;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => {
                stats.record_error();
                continue;
            }
        };

        // Symlinks are counted, never followed
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => {
                stats.record_error();
                continue;
            }
        };

        let path = entry.path();
        if !file_type.is_dir() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            stats.record_file(size);
            continue;
        }

        let within_depth = options.max_depth.map(|max| child_depth <= max).unwrap_or(true);
        if !within_depth || options.is_excluded(&path.to_string_lossy()) {
            stats.record_skip();
            continue;
        }

        if h.enqueue(path.as_os_str().as_bytes()) {
            trace!(path = %path.display(), "Directory queued");
        } else {
            warn!(path = %path.display(), "Directory rejected by queue");
            stats.record_error();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalQueue;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join(".snapshot/old")).unwrap();
        fs::write(dir.path().join("top.txt"), b"12345").unwrap();
        fs::write(dir.path().join("a/b/inner.txt"), b"123").unwrap();
        dir
    }

    fn drain(options: &WalkOptions) -> WalkStats {
        let stats = WalkStats::default();
        let mut queue = LocalQueue::new(4096);
        queue.enqueue(options.root.as_os_str().as_bytes()).unwrap();

        while let Some(item) = queue.dequeue() {
            let dir = Path::new(OsStr::from_bytes(item.as_bytes())).to_path_buf();
            process_directory(&dir, options, &mut queue, &stats);
        }
        stats
    }

    #[test]
    fn test_walk_counts_tree() {
        let dir = tree();
        let options = WalkOptions::new(dir.path().to_path_buf(), None, &[]).unwrap();

        let stats = drain(&options);
        assert_eq!(stats.dirs.load(Ordering::Relaxed), 6);
        assert_eq!(stats.files.load(Ordering::Relaxed), 2);
        assert_eq!(stats.bytes.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_walk_depth_and_exclude() {
        let dir = tree();
        let options = WalkOptions::new(
            dir.path().to_path_buf(),
            Some(1),
            &[r"\.snapshot".to_string()],
        )
        .unwrap();

        let stats = drain(&options);
        // root and a; a/b is too deep, .snapshot is excluded
        assert_eq!(stats.dirs.load(Ordering::Relaxed), 2);
        assert_eq!(stats.skipped.load(Ordering::Relaxed), 2);
        assert_eq!(stats.files.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_depth_of() {
        let root = Path::new("/data");
        assert_eq!(depth_of(root, root), 0);
        assert_eq!(depth_of(Path::new("/data/x/y"), root), 2);
    }
}
