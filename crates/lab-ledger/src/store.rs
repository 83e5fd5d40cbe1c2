//! The ledger store: sole reader and writer of one ledger file.
//!
//! Every mutating call runs a full load -> mutate -> persist cycle inside the
//! resolved [`CrossProcessLock`]; the in-memory copy is never trusted across
//! calls. Queries read the file without the lock and may observe a stale
//! document while another process is writing.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info, trace};

use crate::config::{LedgerConfig, WriteMode};
use crate::error::{LedgerError, Result};
use crate::lock::{global_lock, CrossProcessLock, NoLock};
use crate::naming::counter_naming_strategy;
use crate::record::{LedgerDocument, ParamHash, RunRecord, RunSet};
use crate::schema::parse_document;
use crate::status::Status;

/// Arguments for [`Ledger::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub status: Status,
    pub relpath: String,
    pub param_hash: Option<ParamHash>,
}

impl Default for NewRun {
    fn default() -> Self {
        NewRun {
            status: Status::Pending,
            relpath: ".".to_string(),
            param_hash: None,
        }
    }
}

impl NewRun {
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_relpath(mut self, relpath: impl Into<String>) -> Self {
        self.relpath = relpath.into();
        self
    }

    pub fn with_param_hash(mut self, param_hash: Option<ParamHash>) -> Self {
        self.param_hash = param_hash;
        self
    }
}

/// A status transition and/or file attachments for [`Ledger::log`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunUpdate {
    pub status: Option<Status>,
    pub files: BTreeMap<String, String>,
}

impl RunUpdate {
    pub fn status(status: Status) -> Self {
        RunUpdate {
            status: Some(status),
            files: BTreeMap::new(),
        }
    }

    pub fn files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        RunUpdate::default().with_files(files)
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_files<I, K, V>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.files
            .extend(files.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.files.is_empty()
    }
}

#[derive(Debug)]
pub struct Ledger {
    file: PathBuf,
    config: LedgerConfig,
    lock: RwLock<Option<Arc<dyn CrossProcessLock>>>,
    writer: Mutex<()>,
    cache: Mutex<LedgerDocument>,
}

impl Ledger {
    /// Opens a store outside any registry. Prefer [`crate::open_ledger`] so
    /// call sites in one process share a single instance per file.
    pub fn open(path: impl AsRef<Path>, config: LedgerConfig) -> Result<Self> {
        let file = resolve_ledger_path(path.as_ref())?;
        Ok(Ledger::at_resolved(file, config.validated()?))
    }

    pub(crate) fn at_resolved(file: PathBuf, config: LedgerConfig) -> Self {
        Ledger {
            file,
            config,
            lock: RwLock::new(None),
            writer: Mutex::new(()),
            cache: Mutex::new(LedgerDocument::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Binds a lock to this store, taking precedence over the global one.
    pub fn set_lock(&self, lock: Option<Arc<dyn CrossProcessLock>>) {
        *self.lock.write().unwrap_or_else(PoisonError::into_inner) = lock;
    }

    fn resolve_lock(&self) -> Arc<dyn CrossProcessLock> {
        let bound = self
            .lock
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        bound
            .or_else(global_lock)
            .unwrap_or_else(|| Arc::new(NoLock))
    }

    /// Reserves a fresh uid for `identifier` and records a new run under it.
    pub fn allocate(&self, identifier: &str, run: NewRun) -> Result<String> {
        if identifier.is_empty() {
            return Err(LedgerError::EmptyIdentifier);
        }
        let maxsize = self.config.maxsize;
        let uid = self.edit_document(|doc| {
            let runs = doc.entry(identifier.to_string()).or_default();
            let uid = counter_naming_strategy(runs.keys().map(String::as_str), maxsize).map_err(
                |e| LedgerError::CapacityExceeded {
                    identifier: identifier.to_string(),
                    maxsize: e.maxsize,
                },
            )?;
            let record = RunRecord::new(run.status, run.relpath, run.param_hash);
            runs.insert(uid.clone(), record);
            Ok(uid)
        })?;
        info!(identifier, uid = %uid, status = %run.status, "allocated run");
        Ok(uid)
    }

    /// Applies a status transition and/or file attachments to an existing run.
    /// An empty update touches nothing on disk.
    pub fn log(&self, identifier: &str, uid: &str, update: RunUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.edit_document(|doc| {
            let record = doc
                .get_mut(identifier)
                .and_then(|runs| runs.get_mut(uid))
                .ok_or_else(|| run_not_found(identifier, uid))?;
            if let Some(status) = update.status {
                record.set_status(status);
            }
            if !update.files.is_empty() {
                record.attach(update.files.clone());
            }
            Ok(())
        })?;
        debug!(
            identifier,
            uid,
            status = ?update.status,
            files = update.files.len(),
            "logged run update"
        );
        Ok(())
    }

    pub fn get_record(&self, identifier: &str, uid: &str) -> Result<RunRecord> {
        let mut doc = self.load()?;
        doc.get_mut(identifier)
            .and_then(|runs| runs.swap_remove(uid))
            .ok_or_else(|| run_not_found(identifier, uid))
    }

    pub fn get_uid_record_dict(&self, identifier: &str) -> Result<RunSet> {
        let mut doc = self.load()?;
        doc.swap_remove(identifier)
            .ok_or_else(|| LedgerError::IdentifierNotFound {
                identifier: identifier.to_string(),
            })
    }

    /// First run, in stored order, recorded with `param_hash`. `None` is the
    /// "not tracked" fingerprint and never matches.
    pub fn find_by_param_hash(
        &self,
        identifier: &str,
        param_hash: Option<ParamHash>,
    ) -> Result<Option<(String, RunRecord)>> {
        let Some(param_hash) = param_hash else {
            return Ok(None);
        };
        let runs = self.get_uid_record_dict(identifier)?;
        Ok(runs
            .into_iter()
            .find(|(_, record)| record.param_hash == Some(param_hash)))
    }

    /// Copy of the document as of the last completed load or write.
    pub fn snapshot(&self) -> LedgerDocument {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reads and validates the whole document; a missing file is empty.
    pub fn load(&self) -> Result<LedgerDocument> {
        let bytes = match fs::read(&self.file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LedgerDocument::new()),
            Err(e) => return Err(LedgerError::io(&self.file, e)),
        };
        let doc = parse_document(&self.file, &bytes)?;
        trace!(ledger = %self.file.display(), bytes = bytes.len(), "loaded ledger");
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = doc.clone();
        Ok(doc)
    }

    fn save(&self, doc: &LedgerDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        match self.config.write_mode {
            WriteMode::Atomic => atomic_write_bytes(&self.file, &bytes)?,
            WriteMode::InPlace => {
                fs::write(&self.file, &bytes).map_err(|e| LedgerError::io(&self.file, e))?
            }
        }
        trace!(ledger = %self.file.display(), bytes = bytes.len(), mode = self.config.write_mode.as_str(), "saved ledger");
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = doc.clone();
        Ok(())
    }

    /// One locked read-modify-write cycle. Nothing is written when `edit`
    /// fails.
    fn edit_document<T>(&self, edit: impl FnOnce(&mut LedgerDocument) -> Result<T>) -> Result<T> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = self.resolve_lock();
        let _held = lock.acquire(self.config.lock_timeout())?;
        let mut doc = self.load()?;
        let out = edit(&mut doc)?;
        self.save(&doc)?;
        Ok(out)
    }
}

fn run_not_found(identifier: &str, uid: &str) -> LedgerError {
    LedgerError::RunNotFound {
        identifier: identifier.to_string(),
        uid: uid.to_string(),
    }
}

/// Absolute, parent-canonicalized form of a ledger path. Creates the parent
/// directory.
pub fn resolve_ledger_path(path: &Path) -> Result<PathBuf> {
    let expanded = expand_home(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map_err(|e| LedgerError::io(path, e))?
            .join(expanded)
    };
    let (Some(parent), Some(name)) = (absolute.parent(), absolute.file_name()) else {
        return Err(LedgerError::io(
            &absolute,
            io::Error::new(ErrorKind::InvalidInput, "ledger path must name a file"),
        ));
    };
    fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
    let parent = parent
        .canonicalize()
        .map_err(|e| LedgerError::io(parent, e))?;
    Ok(parent.join(name))
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("ledger");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write_tmp = || -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    if let Err(e) = write_tmp() {
        let _ = fs::remove_file(&tmp);
        return Err(LedgerError::io(&tmp, e));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(LedgerError::io(path, e));
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
