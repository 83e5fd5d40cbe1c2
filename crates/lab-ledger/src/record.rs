use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Opaque fingerprint of a run's input parameters.
pub type ParamHash = i64;

/// `uid -> record` for one identifier, in the order stored on disk.
pub type RunSet = IndexMap<String, RunRecord>;

/// `identifier -> run-set`; the whole persisted ledger. Insertion order is
/// kept through every load and save.
pub type LedgerDocument = IndexMap<String, RunSet>;

/// Persisted state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub status: Status,
    pub param_hash: Option<ParamHash>,
    pub relpath: String,
    pub status_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: IndexMap<String, String>,
}

impl RunRecord {
    pub fn new(status: Status, relpath: impl Into<String>, param_hash: Option<ParamHash>) -> Self {
        let mut record = RunRecord {
            status,
            param_hash,
            relpath: relpath.into(),
            status_time: Utc::now(),
            start_time: None,
            end_time: None,
            files: IndexMap::new(),
        };
        record.timestamp_status();
        record
    }

    /// Stamps the current status: `status_time` always, `start_time` on the
    /// first `Running`, `end_time` on every terminal status.
    pub fn timestamp_status(&mut self) {
        let now = Utc::now();
        self.status_time = now;
        match self.status {
            Status::Running if self.start_time.is_none() => self.start_time = Some(now),
            Status::Done | Status::Error => self.end_time = Some(now),
            _ => {}
        }
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.timestamp_status();
    }

    /// Merges `files` into the attached set; an existing tag is overwritten.
    pub fn attach<I, K, V>(&mut self, files: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (tag, path) in files {
            self.files.insert(tag.into(), path.into());
        }
    }
}
