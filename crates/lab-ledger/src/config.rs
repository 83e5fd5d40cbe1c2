use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

pub const DEFAULT_MAXSIZE: usize = 1000;
pub const DEFAULT_LEDGER_FILE: &str = "metadata.json";

pub const ENV_MAXSIZE: &str = "LAB_LEDGER_MAXSIZE";
pub const ENV_LOCK_TIMEOUT_MS: &str = "LAB_LEDGER_LOCK_TIMEOUT_MS";
pub const ENV_WRITE_MODE: &str = "LAB_LEDGER_WRITE_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Temp file, fsync, rename over the ledger.
    #[default]
    Atomic,
    /// Truncate and rewrite the ledger file directly.
    InPlace,
}

impl WriteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteMode::Atomic => "atomic",
            WriteMode::InPlace => "in_place",
        }
    }
}

impl FromStr for WriteMode {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "atomic" => Ok(WriteMode::Atomic),
            "in_place" => Ok(WriteMode::InPlace),
            other => Err(LedgerError::Config {
                message: format!("unknown write mode '{}' (expected atomic or in_place)", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub maxsize: usize,
    pub lock_timeout_ms: Option<u64>,
    pub write_mode: WriteMode,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            maxsize: DEFAULT_MAXSIZE,
            lock_timeout_ms: None,
            write_mode: WriteMode::default(),
        }
    }
}

impl LedgerConfig {
    /// Reads a YAML (or JSON) config file; omitted keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| LedgerError::io(path, e))?;
        let config: LedgerConfig = serde_yaml::from_str(&raw).map_err(|e| LedgerError::Config {
            message: format!("{}: {}", path.display(), e),
        })?;
        config.validated()
    }

    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_MAXSIZE) {
            self.maxsize = parse_number(ENV_MAXSIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOCK_TIMEOUT_MS) {
            self.lock_timeout_ms = if raw.trim().is_empty() {
                None
            } else {
                Some(parse_number(ENV_LOCK_TIMEOUT_MS, &raw)?)
            };
        }
        if let Some(raw) = lookup(ENV_WRITE_MODE) {
            self.write_mode = raw.trim().parse()?;
        }
        self.validated()
    }

    pub fn validated(self) -> Result<Self> {
        if self.maxsize == 0 {
            return Err(LedgerError::Config {
                message: "maxsize must be at least 1".to_string(),
            });
        }
        Ok(self)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| LedgerError::Config {
        message: format!("{} must be a non-negative integer, got '{}'", key, raw),
    })
}
