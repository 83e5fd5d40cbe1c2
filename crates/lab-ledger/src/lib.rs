//! File-persisted run ledger shared by cooperating processes.
//!
//! The crate exposes:
//! - [`Ledger`]: load/validate/mutate/persist cycles over one JSON ledger file.
//! - [`LedgerRegistry`] / [`open_ledger`]: one shared store per file per process.
//! - [`CrossProcessLock`] with [`FileLock`] and [`NoLock`]: writer serialization
//!   across processes, installed with [`set_global_lock`].
//! - [`Project`] / [`Session`] / [`Aggregator`]: folder layout, parameter-based
//!   resume and result joining on top of the store.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod lock;
pub mod naming;
pub mod params;
pub mod project;
pub mod record;
pub mod registry;
pub mod schema;
pub mod session;
pub mod status;
pub mod store;

pub use aggregate::{Aggregator, IntoRow, Row};
pub use config::{LedgerConfig, WriteMode, DEFAULT_LEDGER_FILE, DEFAULT_MAXSIZE};
pub use error::{LedgerError, Result};
pub use lock::{global_lock, set_global_lock, CrossProcessLock, FileLock, LockGuard, NoLock};
pub use naming::{counter_naming_strategy, CapacityError};
pub use params::{flatten, hash_params};
pub use project::{ExistingRun, Project, SessionOptions, StorageMode};
pub use record::{LedgerDocument, ParamHash, RunRecord, RunSet};
pub use registry::{open_ledger, LedgerRegistry};
pub use session::Session;
pub use status::Status;
pub use store::{Ledger, NewRun, RunUpdate};
