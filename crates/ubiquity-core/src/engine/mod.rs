//! Persistence engine boundary
//!
//! The coordinator never reads or writes records itself. It asks a
//! [`PersistenceEngine`] to open stores, to migrate one store into another
//! and to merge imported changes into the application's [`DataContext`].
//!
//! [`SqliteEngine`] is the bundled implementation: one SQLite file per
//! store, with an append-only transaction log for cloud stores.

mod log;
mod schema;
mod sqlite;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::SchemaReference;
use crate::models::{BackendKind, ImportedChanges, Record, RecordChange};

pub use log::{LogEntry, TransactionLog};
pub use sqlite::{SqliteEngine, SqliteStore};

/// Extra option allowing a store to be reopened with a different schema
pub const ALLOW_SCHEMA_CHANGE: &str = "allow_schema_change";

/// Errors raised by a persistence engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The store file could not be opened
    #[error("Failed to open store '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Permission denied opening or writing the store
    #[error("Permission denied: cannot open store '{path}'")]
    PermissionDenied { path: PathBuf },

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Transaction log could not be read or written
    #[error("Transaction log error on '{path}': {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Record payload could not be encoded/decoded
    #[error("Invalid record data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store was created for another schema
    #[error("Store '{path}' was created with schema '{found}', expected '{expected}'")]
    SchemaMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// Target store already exists
    #[error("Store '{path}' already exists")]
    AlreadyExists { path: PathBuf },

    /// The application's context rejected a change
    #[error("Data context rejected change for {id}: {message}")]
    Context { id: Uuid, message: String },
}

impl EngineError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            EngineError::PermissionDenied { .. } => true,
            EngineError::Log { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Options a store is opened with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOptions {
    pub schema: SchemaReference,
    /// Application supplied options, passed through untouched
    pub extra: BTreeMap<String, String>,
    /// Directory receiving this store's transaction log (cloud stores only)
    pub transaction_log: Option<PathBuf>,
}

impl StoreOptions {
    /// Whether a boolean extra option is switched on
    pub fn flag(&self, key: &str) -> bool {
        self.extra
            .get(key)
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false)
    }
}

/// An open store attached (or about to be attached) to the coordinator
pub trait StoreHandle: Send {
    fn kind(&self) -> BackendKind;

    fn path(&self) -> &Path;

    fn record_count(&self) -> EngineResult<u64>;

    fn records(&self) -> EngineResult<Vec<Record>>;

    fn get(&self, id: Uuid) -> EngineResult<Option<Record>>;

    /// Apply changes atomically
    fn apply(&mut self, changes: &[RecordChange]) -> EngineResult<()>;

    /// Flush and release the store
    fn close(self: Box<Self>) -> EngineResult<()>;
}

/// The application's working context that imported changes are merged into
pub trait DataContext: Send {
    fn apply_change(&mut self, change: &RecordChange) -> anyhow::Result<()>;

    /// Persist everything applied so far
    fn save(&mut self) -> anyhow::Result<()>;
}

/// The record-level persistence engine
pub trait PersistenceEngine: Send + Sync {
    /// Open the store at `path`, creating it when absent
    fn open_store(
        &self,
        path: &Path,
        kind: BackendKind,
        options: &StoreOptions,
    ) -> EngineResult<Box<dyn StoreHandle>>;

    /// Create a new store at `target` holding every record of `source`
    ///
    /// A failed copy may leave a partial target behind; the caller removes it.
    fn migrate_store(
        &self,
        source: &dyn StoreHandle,
        target: &Path,
        options: &StoreOptions,
        progress: &mut dyn FnMut(&str),
    ) -> EngineResult<Box<dyn StoreHandle>>;

    /// Merge imported changes into the application's context
    fn merge_changes(
        &self,
        changes: &ImportedChanges,
        context: &mut dyn DataContext,
    ) -> EngineResult<()>;

    /// Receive changes the engine imported from other devices
    fn subscribe_imports(&self) -> broadcast::Receiver<ImportedChanges>;
}

/// Paths of a store file and the sidecars SQLite may leave next to it
pub fn store_files(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(suffix);
        files.push(PathBuf::from(sidecar));
    }
    files
}
