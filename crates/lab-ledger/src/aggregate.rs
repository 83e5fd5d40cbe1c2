//! Joins the JSON results attached to many runs into flat rows.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::params::flatten;
use crate::store::Ledger;

pub const UID_COLUMN: &str = "uid";

pub type Row = BTreeMap<String, Value>;

/// A typed result payload that lays itself out as one aggregation row.
pub trait IntoRow {
    fn into_row(self) -> Row;
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    groups: BTreeMap<String, Vec<String>>,
    ledger: Arc<Ledger>,
}

impl Aggregator {
    /// `groups` maps an output name to the identifiers whose runs it joins.
    pub fn new(groups: BTreeMap<String, Vec<String>>, ledger: Arc<Ledger>) -> Self {
        Aggregator { groups, ledger }
    }

    /// For every group, one row per uid: the flattened contents of the file
    /// attached under `file_tag` by each identifier's run with that uid, plus
    /// a `uid` column. Runs without the tag are skipped.
    pub fn aggregate(&self, file_tag: &str) -> Result<BTreeMap<String, Vec<Row>>> {
        self.aggregate_with(file_tag, |payload| Ok(flatten(&payload)))
    }

    /// Like [`Aggregator::aggregate`], but each payload is decoded as `T` and
    /// laid out by [`IntoRow`] instead of the generic `__` flattening.
    pub fn aggregate_as<T>(&self, file_tag: &str) -> Result<BTreeMap<String, Vec<Row>>>
    where
        T: DeserializeOwned + IntoRow,
    {
        self.collect(file_tag, |path, payload| {
            let typed: T = serde_json::from_value(payload).map_err(|source| {
                LedgerError::Payload {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            Ok(typed.into_row())
        })
    }

    /// Aggregates with a caller-supplied payload-to-row conversion.
    pub fn aggregate_with<F>(
        &self,
        file_tag: &str,
        to_row: F,
    ) -> Result<BTreeMap<String, Vec<Row>>>
    where
        F: Fn(Value) -> Result<Row>,
    {
        self.collect(file_tag, |_, payload| to_row(payload))
    }

    fn collect<F>(&self, file_tag: &str, to_row: F) -> Result<BTreeMap<String, Vec<Row>>>
    where
        F: Fn(&Path, Value) -> Result<Row>,
    {
        let mut out = BTreeMap::new();
        for (name, identifiers) in &self.groups {
            let mut rows: BTreeMap<String, Row> = BTreeMap::new();
            for identifier in identifiers {
                let runs = self.ledger.get_uid_record_dict(identifier)?;
                for (uid, record) in runs {
                    let Some(stored) = record.files.get(file_tag) else {
                        continue;
                    };
                    let path = self.resolve(stored);
                    let fields = to_row(&path, read_payload(&path)?)?;
                    let row = rows.entry(uid.clone()).or_default();
                    row.extend(fields);
                    row.insert(UID_COLUMN.to_string(), Value::String(uid));
                }
            }
            debug!(group = %name, rows = rows.len(), file_tag, "aggregated group");
            out.insert(name.clone(), rows.into_values().collect());
        }
        Ok(out)
    }

    fn resolve(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.ledger.path().parent() {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        }
    }
}

fn read_payload(path: &Path) -> Result<Value> {
    let raw = fs::read(path).map_err(|e| LedgerError::io(path, e))?;
    serde_json::from_slice(&raw).map_err(|source| LedgerError::Payload {
        path: path.to_path_buf(),
        source,
    })
}
