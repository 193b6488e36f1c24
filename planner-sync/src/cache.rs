//! Time-bounded local cache of workspace snapshots.
//!
//! One entry per [`WorkspaceKey`] holding the last known tasks and
//! assignees plus the time they were captured. Entries older than the TTL
//! are treated as absent and evicted on read; they are never partially
//! reused.
//!
//! The cache is an optimization, not a source of truth. [`CacheLayer`]
//! never returns an error: backend failures (disk full, permissions,
//! corrupt data) are logged with `tracing::warn!` and the operation
//! degrades to a miss or a no-op.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use planner_proto::task::{Assignee, Task, WorkspaceKey};

use crate::clock::Clock;

/// How long a snapshot stays usable.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Prefix of every cache entry name.
const ENTRY_PREFIX: &str = "workload_data_";

/// Errors raised by cache backends.
///
/// These never escape [`CacheLayer`]; they exist so backends can report
/// what went wrong for the log line.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Reading or writing the backing storage failed.
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),

    /// The entry could not be serialized.
    #[error("failed to encode cache entry: {0}")]
    Encode(postcard::Error),

    /// The stored bytes are not a valid entry.
    #[error("corrupt cache entry: {0}")]
    Decode(postcard::Error),
}

/// Storage for encoded cache entries.
pub trait CacheBackend: Send + Sync {
    /// Return the stored bytes for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be read.
    fn load(&self, key: &WorkspaceKey) -> Result<Option<Vec<u8>>, CacheError>;

    /// Replace the stored bytes for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be written.
    fn store(&self, key: &WorkspaceKey, bytes: &[u8]) -> Result<(), CacheError>;

    /// Delete the entry for `key`. Deleting a missing entry is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be modified.
    fn remove(&self, key: &WorkspaceKey) -> Result<(), CacheError>;
}

/// A cached workspace dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every task in the workspace.
    pub tasks: Vec<Task>,
    /// Every assignee in the workspace.
    pub assignees: Vec<Assignee>,
}

#[derive(Debug, Deserialize)]
struct CacheEntry {
    captured_at_ms: u64,
    tasks: Vec<Task>,
    assignees: Vec<Assignee>,
}

#[derive(Serialize)]
struct CacheEntryRef<'a> {
    captured_at_ms: u64,
    tasks: &'a [Task],
    assignees: &'a [Assignee],
}

/// Best-effort, TTL-bounded snapshot cache.
pub struct CacheLayer {
    backend: Box<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}

impl CacheLayer {
    /// Creates a cache over `backend` whose entries live for `ttl`.
    pub fn new(backend: impl CacheBackend + 'static, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            backend: Box::new(backend),
            clock,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// A cache that only lives as long as the process.
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self::new(MemoryCacheBackend::default(), clock, ttl)
    }

    /// The fresh snapshot for `key`, if there is one.
    ///
    /// Expired and unreadable entries are evicted and reported as a miss.
    pub fn read(&self, key: &WorkspaceKey) -> Option<Snapshot> {
        let bytes = match self.backend.load(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(workspace = %key, error = %err, "cache read failed, treating as miss");
                return None;
            }
        };

        let entry: CacheEntry = match postcard::from_bytes(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    workspace = %key,
                    error = %CacheError::Decode(err),
                    "discarding unreadable cache entry"
                );
                self.evict(key);
                return None;
            }
        };

        let age_ms = self.clock.now_ms().saturating_sub(entry.captured_at_ms);
        if age_ms >= self.ttl_ms {
            tracing::debug!(workspace = %key, age_ms, "cache entry expired");
            self.evict(key);
            return None;
        }

        tracing::debug!(
            workspace = %key,
            age_ms,
            tasks = entry.tasks.len(),
            "cache hit"
        );
        Some(Snapshot {
            tasks: entry.tasks,
            assignees: entry.assignees,
        })
    }

    /// Replace the entry for `key`, stamped with the current time.
    pub fn write(&self, key: &WorkspaceKey, tasks: &[Task], assignees: &[Assignee]) {
        let entry = CacheEntryRef {
            captured_at_ms: self.clock.now_ms(),
            tasks,
            assignees,
        };
        let bytes = match postcard::to_allocvec(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(workspace = %key, error = %CacheError::Encode(err), "cache write skipped");
                return;
            }
        };
        if let Err(err) = self.backend.store(key, &bytes) {
            tracing::warn!(workspace = %key, error = %err, "cache write failed, continuing without cache");
        }
    }

    /// Drop the entry for `key`.
    pub fn invalidate(&self, key: &WorkspaceKey) {
        tracing::debug!(workspace = %key, "invalidating cache entry");
        self.evict(key);
    }

    /// How long entries stay fresh.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    fn evict(&self, key: &WorkspaceKey) {
        if let Err(err) = self.backend.remove(key) {
            tracing::warn!(workspace = %key, error = %err, "cache eviction failed");
        }
    }
}

/// Keeps entries in process memory. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheBackend {
    entries: Arc<Mutex<HashMap<WorkspaceKey, Vec<u8>>>>,
}

impl MemoryCacheBackend {
    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn load(&self, key: &WorkspaceKey) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &WorkspaceKey, bytes: &[u8]) -> Result<(), CacheError> {
        self.entries.lock().insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &WorkspaceKey) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Keeps one file per workspace key in a directory.
#[derive(Debug, Clone)]
pub struct FileCacheBackend {
    dir: PathBuf,
}

impl FileCacheBackend {
    /// Store entries under `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store entries under the platform cache directory.
    ///
    /// Returns `None` if the platform has no cache directory.
    #[must_use]
    pub fn in_user_cache_dir() -> Option<Self> {
        dirs::cache_dir().map(|dir| Self::new(dir.join("planner-sync")))
    }

    /// The directory entries live in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &WorkspaceKey) -> PathBuf {
        let name: String = key
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{ENTRY_PREFIX}{name}.bin"))
    }
}

impl CacheBackend for FileCacheBackend {
    fn load(&self, key: &WorkspaceKey) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, key: &WorkspaceKey, bytes: &[u8]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &WorkspaceKey) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::clock::ManualClock;

    fn dataset() -> (Vec<Task>, Vec<Assignee>) {
        let mut task = Task::new("t-1", "Write release notes", 4.0);
        task.assignee = Some("alice".into());
        task.start = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0);
        task.end = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(13, 0, 0);
        task.project = Some("launch".into());
        (
            vec![task, Task::new("t-2", "Backlog", 2.0)],
            vec![Assignee::new("alice", "Alice", 40.0)],
        )
    }

    fn layer(backend: impl CacheBackend + 'static) -> (CacheLayer, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let layer = CacheLayer::new(backend, Arc::new(clock.clone()), DEFAULT_CACHE_TTL);
        (layer, clock)
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn cache_can_move_into_the_engine_task() {
        assert_send_sync::<CacheLayer>();
        assert_send_sync::<MemoryCacheBackend>();
        assert_send_sync::<FileCacheBackend>();
        assert_send_sync::<Box<dyn CacheBackend>>();
    }

    #[test]
    fn round_trip_within_ttl() {
        let (cache, clock) = layer(MemoryCacheBackend::default());
        let key = WorkspaceKey::new("engineering");
        let (tasks, assignees) = dataset();

        cache.write(&key, &tasks, &assignees);
        clock.advance(Duration::from_secs(299));
        let snapshot = cache.read(&key).unwrap();
        assert_eq!(snapshot.tasks, tasks);
        assert_eq!(snapshot.assignees, assignees);
    }

    #[test]
    fn expired_entry_is_absent_and_evicted() {
        let backend = MemoryCacheBackend::default();
        let (cache, clock) = layer(backend.clone());
        let key = WorkspaceKey::new("engineering");
        let (tasks, assignees) = dataset();

        cache.write(&key, &tasks, &assignees);
        clock.advance(Duration::from_secs(300));
        assert!(cache.read(&key).is_none());
        assert!(backend.is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let (cache, _clock) = layer(MemoryCacheBackend::default());
        let (tasks, assignees) = dataset();
        cache.write(&WorkspaceKey::new("a"), &tasks, &assignees);
        assert!(cache.read(&WorkspaceKey::new("b")).is_none());
        assert!(cache.read(&WorkspaceKey::new("a")).is_some());
    }

    #[test]
    fn invalidate_removes_entry() {
        let (cache, _clock) = layer(MemoryCacheBackend::default());
        let key = WorkspaceKey::new("ops");
        let (tasks, assignees) = dataset();
        cache.write(&key, &tasks, &assignees);
        cache.invalidate(&key);
        assert!(cache.read(&key).is_none());
        cache.invalidate(&key);
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_evicted() {
        let backend = MemoryCacheBackend::default();
        let key = WorkspaceKey::new("ops");
        backend.store(&key, &[0xff, 0xff, 0xff]).unwrap();
        let (cache, _clock) = layer(backend.clone());
        assert!(cache.read(&key).is_none());
        assert!(backend.is_empty());
    }

    #[test]
    fn file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileCacheBackend::new(dir.path().join("nested"));
        let (cache, _clock) = layer(backend.clone());
        let key = WorkspaceKey::new("R&D / west");
        let (tasks, assignees) = dataset();

        cache.write(&key, &tasks, &assignees);
        let path = backend.path_for(&key);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "workload_data_R_D___west.bin"
        );
        assert!(path.exists());
        assert_eq!(cache.read(&key).unwrap().tasks, tasks);

        cache.invalidate(&key);
        assert!(!path.exists());
    }

    #[test]
    fn unwritable_directory_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();
        let (cache, _clock) = layer(FileCacheBackend::new(blocker.join("cache")));
        let key = WorkspaceKey::new("ops");
        let (tasks, assignees) = dataset();

        cache.write(&key, &tasks, &assignees);
        assert!(cache.read(&key).is_none());
    }

    #[test]
    fn ttl_is_reported() {
        let cache = CacheLayer::in_memory(Arc::new(ManualClock::new(0)), Duration::from_secs(7));
        assert_eq!(cache.ttl(), Duration::from_secs(7));
    }
}
