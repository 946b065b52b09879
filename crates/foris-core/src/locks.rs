//! Named read/write locks.
//!
//! Handlers serialize access to shared external state (the uci store, the
//! i2c crypto bus, init scripts, the federation directory) through named
//! locks handed out by a [`LockRegistry`]. Two backends share one guard
//! type:
//!
//! - **In-process**: a per-name `tokio::sync::RwLock`, used when a single
//!   daemon process owns all workers (unix socket, MQTT).
//! - **Cross-process**: a per-name `flock`-ed file under a lock directory,
//!   used for the ubus transport where sibling processes may serve the
//!   same external state.
//!
//! Guards are RAII: acquisition is scoped and every exit path, including
//! failures, releases the lock. Readers coexist; a writer excludes all
//! other holders. Fairness is left to the underlying primitive.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

/// Lock guarding the uci config store.
pub const LOCK_UCI: &str = "uci";
/// Lock guarding the hardware crypto bus and thermometer.
pub const LOCK_I2C: &str = "i2c";
/// Lock guarding the federation directory and records.
pub const LOCK_SUBORDINATES: &str = "subordinates";

/// Lock name for one init script.
#[must_use]
pub fn service_lock_name(script: &str) -> String {
    format!("service.{script}")
}

/// Acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Backend selection, decided once at startup by the transport.
#[derive(Debug, Clone)]
pub enum LockBackend {
    /// Per-name async rwlocks inside this process.
    InProcess,
    /// Per-name lock files under `dir`, visible to sibling processes.
    CrossProcess { dir: PathBuf },
}

/// Lock acquisition failures. Only the cross-process backend can fail.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to open lock file for '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to acquire {mode:?} lock '{name}': {source}")]
    Acquire {
        name: String,
        mode: LockMode,
        #[source]
        source: std::io::Error,
    },
    #[error("lock task was cancelled")]
    Cancelled,
}

/// Registry handing out scoped guards for named locks.
pub struct LockRegistry {
    backend: LockBackend,
    // Lazily populated; a lock exists for the lifetime of the process
    // once first requested.
    slots: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockRegistry {
    #[must_use]
    pub fn new(backend: LockBackend) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the named lock for shared (read) access.
    pub async fn read(&self, name: &str) -> Result<LockGuard, LockError> {
        self.acquire(name, LockMode::Read).await
    }

    /// Acquire the named lock for exclusive (write) access.
    pub async fn write(&self, name: &str) -> Result<LockGuard, LockError> {
        self.acquire(name, LockMode::Write).await
    }

    async fn acquire(&self, name: &str, mode: LockMode) -> Result<LockGuard, LockError> {
        trace!(lock = name, ?mode, "acquiring named lock");
        let inner = match &self.backend {
            LockBackend::InProcess => {
                let slot = self.slot(name);
                match mode {
                    LockMode::Read => GuardInner::Read(slot.read_owned().await),
                    LockMode::Write => GuardInner::Write(slot.write_owned().await),
                }
            }
            LockBackend::CrossProcess { dir } => {
                let path = dir.join(format!("{name}.lock"));
                let lock_name = name.to_string();
                // flock(2) blocks; run it on the blocking pool so the
                // worker thread stays free.
                let file = tokio::task::spawn_blocking(move || {
                    let file = OpenOptions::new()
                        .create(true)
                        .truncate(false)
                        .write(true)
                        .open(&path)
                        .map_err(|source| LockError::Open {
                            name: lock_name.clone(),
                            source,
                        })?;
                    let locked = match mode {
                        LockMode::Read => file.lock_shared(),
                        LockMode::Write => file.lock_exclusive(),
                    };
                    locked.map_err(|source| LockError::Acquire {
                        name: lock_name,
                        mode,
                        source,
                    })?;
                    Ok::<File, LockError>(file)
                })
                .await
                .map_err(|_| LockError::Cancelled)??;
                GuardInner::File(FileGuard { file })
            }
        };
        trace!(lock = name, ?mode, "acquired named lock");
        Ok(LockGuard {
            _inner: inner,
            name: name.to_string(),
        })
    }

    fn slot(&self, name: &str) -> Arc<RwLock<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

/// Scoped guard for one named lock; releases on drop.
pub struct LockGuard {
    _inner: GuardInner,
    name: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        trace!(lock = %self.name, "releasing named lock");
    }
}

enum GuardInner {
    Read(tokio::sync::OwnedRwLockReadGuard<()>),
    Write(tokio::sync::OwnedRwLockWriteGuard<()>),
    File(FileGuard),
}

struct FileGuard {
    file: File,
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        // Closing the descriptor would release the flock anyway; the
        // explicit unlock keeps the release point deterministic.
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    async fn exclusion_observed(registry: Arc<LockRegistry>) {
        // Two writers log time-stamped critical sections; the sections
        // must not overlap.
        let mut spans: Vec<(Instant, Instant)> = Vec::new();
        let mut handles = Vec::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let registry = Arc::clone(&registry);
            let results = Arc::clone(&results);
            handles.push(tokio::spawn(async move {
                let _guard = registry.write("exclusion-test").await.unwrap();
                let begin = Instant::now();
                tokio::time::sleep(Duration::from_millis(30)).await;
                let end = Instant::now();
                results.lock().unwrap().push((begin, end));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        spans.extend(results.lock().unwrap().iter().copied());
        assert_eq!(spans.len(), 2);
        let (a, b) = (spans[0], spans[1]);
        assert!(a.1 <= b.0 || b.1 <= a.0, "writer critical sections overlapped");
    }

    #[tokio::test]
    async fn in_process_writers_exclude_each_other() {
        exclusion_observed(Arc::new(LockRegistry::new(LockBackend::InProcess))).await;
    }

    #[tokio::test]
    async fn cross_process_writers_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        exclusion_observed(Arc::new(LockRegistry::new(LockBackend::CrossProcess {
            dir: dir.path().to_path_buf(),
        })))
        .await;
    }

    #[tokio::test]
    async fn readers_coexist() {
        let registry = LockRegistry::new(LockBackend::InProcess);
        let first = registry.read("shared").await.unwrap();
        // A second reader must not block; acquire with a timeout.
        let second = tokio::time::timeout(Duration::from_millis(200), registry.read("shared"))
            .await
            .expect("second reader timed out")
            .unwrap();
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let registry = LockRegistry::new(LockBackend::InProcess);
        let a = registry.write("alpha").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(200), registry.write("beta"))
            .await
            .expect("independent lock blocked")
            .unwrap();
        drop(a);
        drop(b);
    }
}
