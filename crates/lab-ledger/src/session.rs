use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{LedgerError, Result};
use crate::project::StorageMode;
use crate::record::{ParamHash, RunRecord};
use crate::status::Status;
use crate::store::{Ledger, RunUpdate};

/// Handle on one allocated (or resumed) run.
#[derive(Debug, Clone)]
pub struct Session {
    ledger: Arc<Ledger>,
    identifier: String,
    uid: String,
    project_path: PathBuf,
    param_hash: Option<ParamHash>,
    storage: StorageMode,
    resumed: bool,
}

impl Session {
    pub(crate) fn new(
        ledger: Arc<Ledger>,
        identifier: String,
        uid: String,
        project_path: PathBuf,
        param_hash: Option<ParamHash>,
        storage: StorageMode,
        resumed: bool,
    ) -> Self {
        Session {
            ledger,
            identifier,
            uid,
            project_path,
            param_hash,
            storage,
            resumed,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn param_hash(&self) -> Option<ParamHash> {
        self.param_hash
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn record(&self) -> Result<RunRecord> {
        self.ledger.get_record(&self.identifier, &self.uid)
    }

    pub fn status(&self) -> Result<Status> {
        Ok(self.record()?.status)
    }

    pub fn is_done(&self) -> Result<bool> {
        Ok(self.status()? == Status::Done)
    }

    pub fn start(&self) -> Result<()> {
        self.set_status(Status::Running)
    }

    pub fn done(&self) -> Result<()> {
        self.set_status(Status::Done)
    }

    pub fn error(&self) -> Result<()> {
        self.set_status(Status::Error)
    }

    fn set_status(&self, status: Status) -> Result<()> {
        self.ledger
            .log(&self.identifier, &self.uid, RunUpdate::status(status))
    }

    pub fn attach_files<I, K, P>(&self, files: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: AsRef<Path>,
    {
        let update = RunUpdate::files(
            files
                .into_iter()
                .map(|(tag, path)| (tag, path.as_ref().to_string_lossy().into_owned())),
        );
        self.ledger.log(&self.identifier, &self.uid, update)
    }

    pub fn files(&self) -> Result<BTreeMap<String, PathBuf>> {
        Ok(self
            .record()?
            .files
            .into_iter()
            .map(|(tag, path)| (tag, PathBuf::from(path)))
            .collect())
    }

    /// Folder holding this run's files; created if missing.
    pub fn folder(&self) -> Result<PathBuf> {
        let path = match self.storage {
            StorageMode::Subfolder => self.project_path.join(&self.uid),
            StorageMode::Prefix => self.project_path.clone(),
        };
        fs::create_dir_all(&path).map_err(|e| LedgerError::io(&path, e))?;
        Ok(path)
    }

    /// `<folder>/<[uid_]identifier_name>`: parts are joined with `_`, the uid
    /// only in prefix mode, the identifier only when requested.
    pub fn path(&self, name: Option<&str>, include_identifier: bool) -> Result<PathBuf> {
        let mut parts: Vec<&str> = Vec::new();
        if self.storage == StorageMode::Prefix {
            parts.push(&self.uid);
        }
        if include_identifier {
            parts.push(&self.identifier);
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            parts.push(name);
        }
        Ok(self.folder()?.join(parts.join("_")))
    }
}
