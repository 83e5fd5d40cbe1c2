//! Cross-process mutual exclusion for ledger writers.
//!
//! A lock handle is installed once per process (typically by a worker-pool
//! initializer) with [`set_global_lock`] and is picked up by every mutating
//! ledger call. Without one, writers fall back to [`NoLock`].

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{LedgerError, Result};

const POLL_START: Duration = Duration::from_millis(2);
const POLL_MAX: Duration = Duration::from_millis(100);
const SLOW_WAIT: Duration = Duration::from_secs(1);

pub trait CrossProcessLock: Send + Sync + fmt::Debug {
    /// Blocks until the lock is held, or until `timeout` elapses.
    fn acquire(&self, timeout: Option<Duration>) -> Result<LockGuard>;
}

/// Held critical section; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl LockGuard {
    pub fn unlocked() -> Self {
        LockGuard {
            file: None,
            path: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            if let Some(path) = &self.path {
                debug!(lock = %path.display(), "released ledger lock");
            }
        }
    }
}

/// Serial-mode lock: every acquisition succeeds immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

impl CrossProcessLock for NoLock {
    fn acquire(&self, _timeout: Option<Duration>) -> Result<LockGuard> {
        Ok(LockGuard::unlocked())
    }
}

/// Advisory exclusive `flock` on a sidecar file.
///
/// Locks belong to the open file description, so two `FileLock`s on the same
/// path exclude each other even inside one process.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileLock { path: path.into() }
    }

    /// `<ledger file>.lock` next to the ledger.
    pub fn for_ledger(ledger_file: &Path) -> Self {
        let mut name = ledger_file
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| "ledger".into());
        name.push(".lock");
        FileLock::new(ledger_file.with_file_name(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
            }
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| LedgerError::io(&self.path, e))
    }
}

impl CrossProcessLock for FileLock {
    fn acquire(&self, timeout: Option<Duration>) -> Result<LockGuard> {
        let file = self.open()?;
        let started = Instant::now();
        match timeout {
            None => {
                file.lock_exclusive()
                    .map_err(|e| LedgerError::io(&self.path, e))?;
            }
            Some(limit) => {
                let mut delay = POLL_START;
                let mut warned = false;
                loop {
                    match file.try_lock_exclusive() {
                        Ok(()) => break,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(e) => return Err(LedgerError::io(&self.path, e)),
                    }
                    let waited = started.elapsed();
                    if waited >= limit {
                        return Err(LedgerError::LockTimeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    if !warned && waited >= SLOW_WAIT {
                        warn!(lock = %self.path.display(), waited_ms = waited.as_millis() as u64, "still waiting for ledger lock");
                        warned = true;
                    }
                    thread::sleep(delay.min(limit - waited));
                    delay = (delay * 2).min(POLL_MAX);
                }
            }
        }
        let waited = started.elapsed();
        if waited >= SLOW_WAIT {
            warn!(lock = %self.path.display(), waited_ms = waited.as_millis() as u64, "slow ledger lock acquisition");
        }
        debug!(lock = %self.path.display(), waited_us = waited.as_micros() as u64, "acquired ledger lock");
        Ok(LockGuard {
            file: Some(file),
            path: Some(self.path.clone()),
        })
    }
}

static GLOBAL_LOCK: RwLock<Option<Arc<dyn CrossProcessLock>>> = RwLock::new(None);

/// Installs (or with `None`, removes) the process-wide writer lock.
pub fn set_global_lock(lock: Option<Arc<dyn CrossProcessLock>>) {
    let mut slot = GLOBAL_LOCK.write().unwrap_or_else(PoisonError::into_inner);
    *slot = lock;
}

pub fn global_lock() -> Option<Arc<dyn CrossProcessLock>> {
    GLOBAL_LOCK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Held by tests that install a global lock, so they do not overwrite each
/// other's handle.
#[cfg(test)]
pub(crate) static GLOBAL_LOCK_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_root(label: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "lab_ledger_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    #[test]
    fn no_lock_never_blocks() {
        let a = NoLock.acquire(None).expect("first");
        let b = NoLock.acquire(Some(Duration::ZERO)).expect("second");
        assert!(!a.is_held());
        assert!(!b.is_held());
    }

    #[test]
    fn sidecar_path_sits_next_to_ledger() {
        let lock = FileLock::for_ledger(Path::new("/data/results/metadata.json"));
        assert_eq!(lock.path(), Path::new("/data/results/metadata.json.lock"));
    }

    #[test]
    fn file_lock_is_exclusive_until_dropped() {
        let root = temp_root("lock_excl");
        let path = root.join("metadata.json.lock");
        let first = FileLock::new(&path);
        let second = FileLock::new(&path);

        let held = first.acquire(None).expect("first lock must succeed");
        assert!(held.is_held());
        let err = second
            .acquire(Some(Duration::from_millis(30)))
            .expect_err("second lock must time out");
        assert!(
            matches!(err, LedgerError::LockTimeout { .. }),
            "unexpected lock error: {}",
            err
        );
        drop(held);
        let again = second
            .acquire(Some(Duration::from_millis(500)))
            .expect("lock should be re-acquirable");
        drop(again);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn blocked_waiter_proceeds_after_release() {
        let root = temp_root("lock_wait");
        let path = root.join("ledger.lock");
        let holder = FileLock::new(&path).acquire(None).expect("holder");
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let guard = FileLock::new(waiter_path)
                .acquire(Some(Duration::from_secs(10)))
                .expect("waiter eventually acquires");
            drop(guard);
            started.elapsed()
        });
        thread::sleep(Duration::from_millis(50));
        drop(holder);
        let waited = waiter.join().expect("waiter thread");
        assert!(waited >= Duration::from_millis(40), "waited {:?}", waited);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn global_lock_can_be_installed_and_cleared() {
        let _serial = GLOBAL_LOCK_SERIAL
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let root = temp_root("lock_global");
        let installed: Arc<dyn CrossProcessLock> = Arc::new(FileLock::new(root.join("pool.lock")));
        set_global_lock(Some(Arc::clone(&installed)));
        let current = global_lock().expect("installed");
        assert!(Arc::ptr_eq(&current, &installed));
        drop(current.acquire(None).expect("global lock usable"));
        set_global_lock(None);
        assert!(global_lock().is_none());
        let _ = fs::remove_dir_all(root);
    }
}
