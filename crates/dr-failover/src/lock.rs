//! Run locks
//!
//! At most one failover run may hold a given resource (the drilled domain) at
//! a time. [`RunLocks`] excludes runs inside one process; [`FileRunLocks`]
//! takes an advisory file lock so separately scheduled invocations exclude
//! each other too. Either guard frees the key when dropped.

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::DrError;

/// Exclusive, non-blocking lock over a resource key
pub trait RunLock: Send + Sync {
    /// Acquire `key`, failing with [`DrError::RunInProgress`] if it is taken
    fn try_acquire(&self, key: &str) -> Result<RunLockGuard, DrError>;
}

/// Holds a resource key until dropped
pub struct RunLockGuard {
    key: String,
    _hold: Box<dyn Send + Sync>,
}

impl RunLockGuard {
    /// The locked resource key
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for RunLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLockGuard").field("key", &self.key).finish()
    }
}

/// In-process registry of held resource keys
#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl RunLocks {
    /// Empty registry; clones share state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether some guard currently holds `key`
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

impl RunLock for RunLocks {
    fn try_acquire(&self, key: &str) -> Result<RunLockGuard, DrError> {
        if !self.held.lock().insert(key.to_string()) {
            return Err(DrError::RunInProgress(key.to_string()));
        }
        tracing::debug!("Acquired run lock for {}", key);
        Ok(RunLockGuard {
            key: key.to_string(),
            _hold: Box::new(MemoryHold {
                key: key.to_string(),
                held: self.held.clone(),
            }),
        })
    }
}

struct MemoryHold {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for MemoryHold {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
        tracing::debug!("Released run lock for {}", self.key);
    }
}

/// Advisory file locks under a shared directory, one file per key.
///
/// The OS drops the lock when the holding process exits, so a crashed run
/// never leaves a stale lock behind.
#[derive(Debug, Clone)]
pub struct FileRunLocks {
    dir: PathBuf,
}

impl FileRunLocks {
    /// Lock files are created under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Lock file used for `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("dr-failover-{}.lock", name))
    }

    fn open(&self, path: &Path) -> Result<File, DrError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| DrError::Config(format!("cannot create lock directory {}: {}", self.dir.display(), e)))?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| DrError::Config(format!("cannot open lock file {}: {}", path.display(), e)))
    }
}

impl RunLock for FileRunLocks {
    fn try_acquire(&self, key: &str) -> Result<RunLockGuard, DrError> {
        let path = self.path_for(key);
        let mut file = self.open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == ErrorKind::WouldBlock || e.kind() == fs2::lock_contended_error().kind() {
                return Err(DrError::RunInProgress(key.to_string()));
            }
            return Err(DrError::Config(format!("cannot lock {}: {}", path.display(), e)));
        }

        // Owner note for operators; the lock itself is the flock
        if file.set_len(0).is_ok() {
            let _ = writeln!(file, "pid={} key={}", std::process::id(), key);
        }
        tracing::debug!("Acquired run lock {} for {}", path.display(), key);

        Ok(RunLockGuard {
            key: key.to_string(),
            _hold: Box::new(FileHold { file, path }),
        })
    }
}

struct FileHold {
    file: File,
    path: PathBuf,
}

impl Drop for FileHold {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
        tracing::debug!("Released run lock {}", self.path.display());
    }
}
