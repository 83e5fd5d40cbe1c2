//! Folder-organising facade over a shared ledger.
//!
//! A project owns `<root>/metadata.json`; [`Project::sub`] scopes a child to a
//! deeper folder while keeping the same ledger instance.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::{LedgerConfig, DEFAULT_LEDGER_FILE};
use crate::error::{LedgerError, Result};
use crate::params::hash_params;
use crate::registry::open_ledger;
use crate::session::Session;
use crate::store::{Ledger, NewRun};

/// What to do when a run with the same parameter fingerprint already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingRun {
    #[default]
    Resume,
    New,
}

/// Where a session's files live relative to the project folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// `<project>/<uid>/<file>`
    #[default]
    Subfolder,
    /// `<project>/<uid>_<file>`
    Prefix,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub params: Option<Value>,
    pub if_exists: Option<ExistingRun>,
    pub storage: Option<StorageMode>,
}

#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    relpath: PathBuf,
    if_exists: ExistingRun,
    storage: StorageMode,
    ledger: Arc<Ledger>,
}

impl Project {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Project::open_with(root, LedgerConfig::default())
    }

    pub fn open_with(root: impl AsRef<Path>, config: LedgerConfig) -> Result<Self> {
        let ledger = open_ledger(root.as_ref().join(DEFAULT_LEDGER_FILE), config)?;
        let root = ledger
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.as_ref().to_path_buf());
        Ok(Project {
            root,
            relpath: PathBuf::new(),
            if_exists: ExistingRun::default(),
            storage: StorageMode::default(),
            ledger,
        })
    }

    pub fn with_defaults(mut self, if_exists: ExistingRun, storage: StorageMode) -> Self {
        self.if_exists = if_exists;
        self.storage = storage;
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn ledger_path(&self) -> &Path {
        self.ledger.path()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relpath(&self) -> &Path {
        &self.relpath
    }

    /// Directory this project instance points at.
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.relpath)
    }

    pub fn ensure_folder(&self) -> Result<()> {
        let path = self.path();
        fs::create_dir_all(&path).map_err(|e| LedgerError::io(&path, e))
    }

    /// Child project scoped to `<relpath>/<name>`, sharing this ledger.
    pub fn sub(&self, name: &str) -> Result<Project> {
        let mut child = self.clone();
        child.relpath = self.relpath.join(name);
        child.ensure_folder()?;
        Ok(child)
    }

    pub fn session(&self, identifier: &str, params: Option<&Value>) -> Result<Session> {
        self.session_with(
            identifier,
            SessionOptions {
                params: params.cloned(),
                ..SessionOptions::default()
            },
        )
    }

    /// Resumes the run whose fingerprint matches `options.params` (under
    /// [`ExistingRun::Resume`]), or allocates a new one.
    pub fn session_with(&self, identifier: &str, options: SessionOptions) -> Result<Session> {
        let if_exists = options.if_exists.unwrap_or(self.if_exists);
        let storage = options.storage.unwrap_or(self.storage);
        let param_hash = options.params.as_ref().and_then(hash_params);

        let resumed = match if_exists {
            ExistingRun::Resume => match self.ledger.find_by_param_hash(identifier, param_hash) {
                Ok(hit) => hit.map(|(uid, _)| uid),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            ExistingRun::New => None,
        };

        let (uid, is_resumed) = match resumed {
            Some(uid) => {
                info!(identifier, uid = %uid, "resuming run with matching parameters");
                (uid, true)
            }
            None => {
                let run = NewRun::default()
                    .with_relpath(posix_relpath(&self.relpath))
                    .with_param_hash(param_hash);
                (self.ledger.allocate(identifier, run)?, false)
            }
        };

        Ok(Session::new(
            Arc::clone(&self.ledger),
            identifier.to_string(),
            uid,
            self.path(),
            param_hash,
            storage,
            is_resumed,
        ))
    }
}

fn posix_relpath(relpath: &Path) -> String {
    let parts: Vec<String> = relpath
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
