//! Filesystem read cache
//!
//! Short-TTL cache of file contents and directory listings, shared by every
//! loop in the process. A cached entry is only served if the file's mtime
//! and size still match what was cached; any write through the executor
//! invalidates the file and its ancestor directory listings.
//!
//! Lock discipline: plain std mutexes, held only around map access - never
//! across file I/O or an await point.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// A cached file snapshot.
#[derive(Debug, Clone)]
struct CachedFile {
    content: Vec<u8>,
    size: u64,
    mtime: SystemTime,
    cached_at: Instant,
}

/// A cached directory listing: sorted `<type> <name>` lines.
#[derive(Debug, Clone)]
struct CachedDir {
    lines: Vec<String>,
    cached_at: Instant,
}

/// Process-shared read cache.
pub struct FsCache {
    files: Mutex<HashMap<PathBuf, CachedFile>>,
    dirs: Mutex<HashMap<PathBuf, CachedDir>>,
    file_ttl: Duration,
    dir_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FsCache {
    pub fn new(file_ttl: Duration, dir_ttl: Duration) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            file_ttl,
            dir_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Read a file through the cache. A hit requires the entry to be within
    /// TTL and the file's mtime and size unchanged; anything else evicts and
    /// re-reads.
    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let meta = fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let size = meta.len();

        {
            let files = self.files.lock().unwrap();
            if let Some(entry) = files.get(path) {
                let fresh = entry.cached_at.elapsed() <= self.file_ttl;
                if fresh && entry.mtime == mtime && entry.size == size {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.content.clone());
                }
            }
        }

        // Miss or stale: read and repopulate.
        self.misses.fetch_add(1, Ordering::Relaxed);
        let content = fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let entry = CachedFile {
            content: content.clone(),
            size,
            mtime,
            cached_at: Instant::now(),
        };
        self.files.lock().unwrap().insert(path.to_path_buf(), entry);
        Ok(content)
    }

    /// List a directory through the cache as sorted `<type> <name>` lines.
    pub fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        {
            let dirs = self.dirs.lock().unwrap();
            if let Some(entry) = dirs.get(path) {
                if entry.cached_at.elapsed() <= self.dir_ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.lines.clone());
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut lines = Vec::new();
        let entries = fs::read_dir(path)
            .with_context(|| format!("Failed to list {}", path.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = match entry.file_type() {
                Ok(t) if t.is_dir() => "dir",
                Ok(t) if t.is_symlink() => "link",
                _ => "file",
            };
            lines.push(format!("{} {}", kind, name));
        }
        lines.sort();

        self.dirs.lock().unwrap().insert(
            path.to_path_buf(),
            CachedDir {
                lines: lines.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(lines)
    }

    /// Invalidate a written file: drop its entry and every cached directory
    /// listing whose path is a prefix of the file's parent directory.
    pub fn invalidate(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);

        if let Some(parent) = path.parent() {
            let mut dirs = self.dirs.lock().unwrap();
            dirs.retain(|dir, _| !parent.starts_with(dir));
        }
    }

    /// Drop everything. Used at teardown and on permission-mode changes.
    pub fn clear(&self) {
        self.files.lock().unwrap().clear();
        self.dirs.lock().unwrap().clear();
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
