use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lru::LruCache;
use tracing::{debug, info, warn};

use tessera_core::{Blob, MemoryThresholds, TaskKey};

use crate::error::WorkerError;

/// What the worker must do about its current memory use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    /// Stop starting new tasks.
    Pause,
    /// Shut down and let the nanny start over.
    Terminate,
}

/// A result written to disk.
struct SpilledEntry {
    path: PathBuf,
    nbytes: u64,
}

/// Key → result store of one worker, backed by a spill directory.
///
/// Memory use counts the results held in memory plus the inputs currently
/// lent out to running tasks (see [`DataStore::reserve`]). Only the former
/// can be spilled.
pub struct DataStore {
    memory: LruCache<TaskKey, Blob>,
    spilled: HashMap<TaskKey, SpilledEntry>,
    directory: PathBuf,
    limit: u64,
    thresholds: MemoryThresholds,
    memory_bytes: u64,
    spilled_bytes: u64,
    reserved_bytes: u64,
    next_file: u64,
}

impl DataStore {
    pub fn new(
        directory: &Path,
        limit: u64,
        thresholds: MemoryThresholds,
    ) -> Result<Self, WorkerError> {
        std::fs::create_dir_all(directory).map_err(|source| WorkerError::Spill {
            path: directory.to_path_buf(),
            source,
        })?;
        Ok(Self {
            memory: LruCache::unbounded(),
            spilled: HashMap::new(),
            directory: directory.to_path_buf(),
            limit: limit.max(1),
            thresholds,
            memory_bytes: 0,
            spilled_bytes: 0,
            reserved_bytes: 0,
            next_file: 0,
        })
    }

    /// Store a result and apply the spill policy.
    pub fn put(&mut self, key: TaskKey, blob: Blob) -> Result<(), WorkerError> {
        self.remove(&key);
        self.memory_bytes += blob.nbytes();
        self.memory.put(key, blob);
        self.enforce_limits();
        Ok(())
    }

    /// Read a result, from disk if it was spilled.
    ///
    /// A spilled key comes back into memory unless that would leave usage
    /// at or above the `spill` threshold.
    pub fn get(&mut self, key: &TaskKey) -> Result<Option<Blob>, WorkerError> {
        if let Some(blob) = self.memory.get(key) {
            return Ok(Some(blob.clone()));
        }
        let Some(entry) = self.spilled.get(key) else {
            return Ok(None);
        };

        let bytes = std::fs::read(&entry.path).map_err(|source| WorkerError::Spill {
            path: entry.path.clone(),
            source,
        })?;
        let blob: Blob = rmp_serde::from_slice(&bytes)?;

        let after = self.used() + entry.nbytes;
        if self.fraction_of(after) >= self.thresholds.spill {
            debug!(key = %key, "read spilled key, leaving it on disk");
            return Ok(Some(blob));
        }

        if let Some(entry) = self.spilled.remove(key) {
            self.spilled_bytes = self.spilled_bytes.saturating_sub(entry.nbytes);
            std::fs::remove_file(&entry.path).ok();
        }
        debug!(key = %key, nbytes = blob.nbytes(), "unspilled key");
        self.memory_bytes += blob.nbytes();
        self.memory.put(key.clone(), blob.clone());
        self.enforce_limits();
        Ok(Some(blob))
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.memory.contains(key) || self.spilled.contains_key(key)
    }

    pub fn is_spilled(&self, key: &TaskKey) -> bool {
        self.spilled.contains_key(key)
    }

    /// Drop a key from memory or disk. Returns whether it was held.
    pub fn remove(&mut self, key: &TaskKey) -> bool {
        if let Some(blob) = self.memory.pop(key) {
            self.memory_bytes = self.memory_bytes.saturating_sub(blob.nbytes());
            return true;
        }
        if let Some(entry) = self.spilled.remove(key) {
            self.spilled_bytes = self.spilled_bytes.saturating_sub(entry.nbytes);
            if let Err(e) = std::fs::remove_file(&entry.path) {
                warn!(key = %key, path = %entry.path.display(), error = %e, "failed to delete spill file");
            }
            return true;
        }
        false
    }

    /// Account for input bytes held by a running task.
    pub fn reserve(&mut self, nbytes: u64) {
        self.reserved_bytes += nbytes;
        self.enforce_limits();
    }

    pub fn unreserve(&mut self, nbytes: u64) {
        self.reserved_bytes = self.reserved_bytes.saturating_sub(nbytes);
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.memory
            .iter()
            .map(|(k, _)| k.clone())
            .chain(self.spilled.keys().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.spilled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes counted against the memory limit.
    pub fn used(&self) -> u64 {
        self.memory_bytes + self.reserved_bytes
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.spilled_bytes
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn pressure(&self) -> MemoryPressure {
        let fraction = self.fraction_of(self.used());
        if fraction >= self.thresholds.terminate {
            MemoryPressure::Terminate
        } else if fraction >= self.thresholds.pause {
            MemoryPressure::Pause
        } else {
            MemoryPressure::Normal
        }
    }

    fn fraction_of(&self, bytes: u64) -> f64 {
        bytes as f64 / self.limit as f64
    }

    /// Spill until usage is below `target`.
    ///
    /// Between `target` and `spill` the least recently used results go
    /// first. At or above `spill` the largest go first.
    fn enforce_limits(&mut self) {
        let fraction = self.fraction_of(self.used());
        if fraction < self.thresholds.target {
            return;
        }
        let largest_first = fraction >= self.thresholds.spill;

        let mut count = 0usize;
        let mut freed = 0u64;
        while self.fraction_of(self.used()) >= self.thresholds.target {
            let victim = if largest_first {
                // Ties go to the least recently used: `iter` runs MRU → LRU.
                self.memory
                    .iter()
                    .max_by_key(|(_, blob)| blob.nbytes())
                    .map(|(k, _)| k.clone())
            } else {
                self.memory.peek_lru().map(|(k, _)| k.clone())
            };
            let Some(key) = victim else {
                break;
            };
            match self.spill(&key) {
                Ok(nbytes) => {
                    count += 1;
                    freed += nbytes;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "spill failed, keeping key in memory");
                    break;
                }
            }
        }

        if count > 0 {
            info!(
                "Spilled {} keys ({:.1} KB) to disk, memory at {:.0}% of limit",
                count,
                freed as f64 / 1024.0,
                self.fraction_of(self.used()) * 100.0
            );
        }
    }

    fn spill(&mut self, key: &TaskKey) -> Result<u64, WorkerError> {
        let Some(blob) = self.memory.peek(key) else {
            return Ok(0);
        };
        let nbytes = blob.nbytes();
        let path = self.directory.join(format!("{:08}.msgpack", self.next_file));
        let encoded = rmp_serde::to_vec(blob)?;
        std::fs::write(&path, encoded).map_err(|source| WorkerError::Spill {
            path: path.clone(),
            source,
        })?;
        self.next_file += 1;

        self.memory.pop(key);
        self.memory_bytes = self.memory_bytes.saturating_sub(nbytes);
        self.spilled_bytes += nbytes;
        self.spilled.insert(key.clone(), SpilledEntry { path, nbytes });
        debug!(key = %key, nbytes, "spilled key");
        Ok(nbytes)
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        // Best-effort cleanup
        std::fs::remove_dir_all(&self.directory).ok();
    }
}
