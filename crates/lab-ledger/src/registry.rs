//! One shared [`Ledger`] per resolved file path within a process.
//!
//! The process-wide registry is created on first use and lives until the
//! process exits; it is never reset. It does nothing across processes, that is
//! the job of [`crate::lock`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::debug;

use crate::config::LedgerConfig;
use crate::error::Result;
use crate::store::{resolve_ledger_path, Ledger};

#[derive(Debug, Default)]
pub struct LedgerRegistry {
    ledgers: Mutex<HashMap<PathBuf, Arc<Ledger>>>,
}

impl LedgerRegistry {
    pub fn new() -> Self {
        LedgerRegistry::default()
    }

    pub fn global() -> &'static LedgerRegistry {
        static GLOBAL: OnceLock<LedgerRegistry> = OnceLock::new();
        GLOBAL.get_or_init(LedgerRegistry::new)
    }

    /// Returns the store registered for `path`, creating it on first request.
    /// `config` is ignored when the path is already registered.
    pub fn open(&self, path: impl AsRef<Path>, config: LedgerConfig) -> Result<Arc<Ledger>> {
        let file = resolve_ledger_path(path.as_ref())?;
        let mut ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = ledgers.get(&file) {
            debug!(ledger = %file.display(), "reusing registered ledger");
            return Ok(Arc::clone(existing));
        }
        let ledger = Arc::new(Ledger::at_resolved(file.clone(), config.validated()?));
        debug!(ledger = %file.display(), maxsize = ledger.config().maxsize, "registered ledger");
        ledgers.insert(file, Arc::clone(&ledger));
        Ok(ledger)
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> Result<bool> {
        let file = resolve_ledger_path(path.as_ref())?;
        Ok(self
            .ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&file))
    }

    pub fn len(&self) -> usize {
        self.ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens `path` through the process-wide registry.
pub fn open_ledger(path: impl AsRef<Path>, config: LedgerConfig) -> Result<Arc<Ledger>> {
    LedgerRegistry::global().open(path, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewRun;
    use chrono::Utc;
    use std::fs;

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
    fn same_resolved_path_yields_same_instance() {
        let root = temp_root("registry_same");
        let registry = LedgerRegistry::new();
        let direct = root.join("metadata.json");
        let roundabout = root.join("sub").join("..").join("metadata.json");

        let first = registry
            .open(&direct, LedgerConfig::default())
            .expect("first");
        let second = registry
            .open(
                &roundabout,
                LedgerConfig {
                    maxsize: 7,
                    ..LedgerConfig::default()
                },
            )
            .expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().maxsize, 1000, "second config is ignored");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&direct).expect("contains"));

        first.allocate("shared", NewRun::default()).expect("allocate");
        assert_eq!(second.snapshot()["shared"].len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn different_paths_get_different_instances() {
        let root = temp_root("registry_diff");
        let registry = LedgerRegistry::new();
        let a = registry
            .open(root.join("a.json"), LedgerConfig::default())
            .expect("a");
        let b = registry
            .open(root.join("nested").join("a.json"), LedgerConfig::default())
            .expect("b");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        assert!(root.join("nested").is_dir(), "parent directory is created");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn registries_are_independent_objects() {
        let root = temp_root("registry_indep");
        let path = root.join("metadata.json");
        let one = LedgerRegistry::new();
        let two = LedgerRegistry::new();
        let a = one.open(&path, LedgerConfig::default()).expect("a");
        let b = two.open(&path, LedgerConfig::default()).expect("b");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(one.open(&path, LedgerConfig::default()).is_ok());
        assert_eq!(one.len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn global_factory_shares_instances() {
        let root = temp_root("registry_global");
        let path = root.join("metadata.json");
        let a = open_ledger(&path, LedgerConfig::default()).expect("a");
        let b = open_ledger(&path, LedgerConfig::default()).expect("b");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(std::ptr::eq(LedgerRegistry::global(), LedgerRegistry::global()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn invalid_config_is_rejected_on_first_open() {
        let root = temp_root("registry_cfg");
        let registry = LedgerRegistry::new();
        let err = registry
            .open(
                root.join("metadata.json"),
                LedgerConfig {
                    maxsize: 0,
                    ..LedgerConfig::default()
                },
            )
            .expect_err("zero capacity");
        assert!(err.to_string().contains("maxsize"), "{}", err);
        assert!(registry.is_empty());
        let _ = fs::remove_dir_all(root);
    }
}
