//! SQLite-backed persistence engine
//!
//! Every store is a single SQLite file. Cloud stores additionally append
//! each applied change to this device's transaction log, and a cloud store
//! created where a log already exists is rebuilt by replaying it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::log::TransactionLog;
use super::schema::{get_meta, init_layout, needs_init, set_meta, SCHEMA_KEY};
use super::{
    DataContext, EngineError, EngineResult, PersistenceEngine, StoreHandle,
    StoreOptions, ALLOW_SCHEMA_CHANGE,
};
use crate::models::{BackendKind, ImportedChanges, Record, RecordChange};

/// Persistence engine storing records in SQLite files
pub struct SqliteEngine {
    /// Names this device's transaction log
    device_id: String,
    imports: broadcast::Sender<ImportedChanges>,
}

impl SqliteEngine {
    /// Create an engine with a random device id
    pub fn new() -> Self {
        Self::with_device_id(format!("device-{}", &Uuid::new_v4().to_string()[..8]))
    }

    pub fn with_device_id(device_id: impl Into<String>) -> Self {
        let (imports, _) = broadcast::channel(32);
        Self {
            device_id: device_id.into(),
            imports,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Signal changes imported from another device
    ///
    /// Called by whatever transport delivers foreign transaction logs.
    /// Returns the number of subscribers that will see the changes.
    pub fn announce_import(&self, changes: ImportedChanges) -> usize {
        self.imports.send(changes).unwrap_or(0)
    }

    fn seed(
        &self,
        records: Vec<Record>,
        target: &Path,
        options: &StoreOptions,
        progress: &mut dyn FnMut(&str),
    ) -> EngineResult<Box<dyn StoreHandle>> {
        let mut store = self.open_store(target, BackendKind::Cloud, options)?;
        let changes: Vec<RecordChange> = records.into_iter().map(RecordChange::Upsert).collect();
        store.apply(&changes)?;
        progress(&format!("Seeded {} records into {:?}", changes.len(), target));
        Ok(store)
    }
}

impl Default for SqliteEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceEngine for SqliteEngine {
    fn open_store(
        &self,
        path: &Path,
        kind: BackendKind,
        options: &StoreOptions,
    ) -> EngineResult<Box<dyn StoreHandle>> {
        let existed = path.exists();
        let conn = open_connection(path)?;

        if needs_init(&conn) {
            init_layout(&conn)?;
        }

        let expected = options.schema.fingerprint();
        match get_meta(&conn, SCHEMA_KEY)? {
            None => set_meta(&conn, SCHEMA_KEY, &expected)?,
            Some(found) if found != expected => {
                if !options.flag(ALLOW_SCHEMA_CHANGE) {
                    return Err(EngineError::SchemaMismatch {
                        path: path.to_path_buf(),
                        expected,
                        found,
                    });
                }
                info!("Store {:?} schema changed from '{}' to '{}'", path, found, expected);
                set_meta(&conn, SCHEMA_KEY, &expected)?;
            }
            Some(_) => {}
        }

        let log = match (kind, &options.transaction_log) {
            (BackendKind::Cloud, Some(dir)) => Some(TransactionLog::open(dir, &self.device_id)?),
            _ => None,
        };

        let mut store = SqliteStore {
            conn,
            path: path.to_path_buf(),
            kind,
            log,
        };

        if !existed {
            store.replay_log()?;
        }

        debug!("Opened {} store {:?}", kind, path);
        Ok(Box::new(store))
    }

    fn migrate_store(
        &self,
        source: &dyn StoreHandle,
        target: &Path,
        options: &StoreOptions,
        progress: &mut dyn FnMut(&str),
    ) -> EngineResult<Box<dyn StoreHandle>> {
        if target.exists() {
            return Err(EngineError::AlreadyExists {
                path: target.to_path_buf(),
            });
        }

        let records = source.records()?;
        progress(&format!(
            "Migrating {} records from {:?} to {:?}",
            records.len(),
            source.path(),
            target
        ));

        self.seed(records, target, options, progress)
    }

    fn merge_changes(
        &self,
        changes: &ImportedChanges,
        context: &mut dyn DataContext,
    ) -> EngineResult<()> {
        for change in &changes.changes {
            context
                .apply_change(change)
                .map_err(|e| EngineError::Context {
                    id: change.record_id(),
                    message: format!("{:#}", e),
                })?;
        }
        Ok(())
    }

    fn subscribe_imports(&self) -> broadcast::Receiver<ImportedChanges> {
        self.imports.subscribe()
    }
}

fn open_connection(path: &Path) -> EngineResult<Connection> {
    Connection::open(path).map_err(|source| {
        let denied = matches!(
            &source,
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::PermissionDenied | ErrorCode::ReadOnly)
        );
        if denied {
            EngineError::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            EngineError::Open {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// An open SQLite store
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    kind: BackendKind,
    log: Option<TransactionLog>,
}

impl SqliteStore {
    /// Rebuild from the transaction log, if there is one
    fn replay_log(&mut self) -> EngineResult<()> {
        let Some(dir) = self.log.as_ref().map(|log| log.dir().to_path_buf()) else {
            return Ok(());
        };

        let entries = TransactionLog::read_all(&dir)?;
        if entries.is_empty() {
            return Ok(());
        }

        let changes: Vec<RecordChange> = entries.into_iter().map(|entry| entry.change).collect();
        write_changes(&mut self.conn, &changes)?;
        info!(
            "Rebuilt {:?} from {} transaction log entries",
            self.path,
            changes.len()
        );
        Ok(())
    }
}

impl StoreHandle for SqliteStore {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn record_count(&self) -> EngineResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn records(&self) -> EngineResult<Vec<Record>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity, payload, updated_at FROM records ORDER BY updated_at, id",
        )?;
        let rows = stmt.query_map([], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn get(&self, id: Uuid) -> EngineResult<Option<Record>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, entity, payload, updated_at FROM records WHERE id = ?")?;
        let mut rows = stmt.query_map([id.to_string()], row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn apply(&mut self, changes: &[RecordChange]) -> EngineResult<()> {
        write_changes(&mut self.conn, changes)?;

        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(changes) {
                warn!("Changes to {:?} were saved but not logged: {}", self.path, e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        let path = self.path;
        self.conn.close().map_err(|(_, e)| EngineError::Open { path, source: e })
    }
}

fn write_changes(conn: &mut Connection, changes: &[RecordChange]) -> EngineResult<()> {
    let tx = conn.transaction()?;
    for change in changes {
        match change {
            RecordChange::Upsert(record) => {
                tx.execute(
                    "INSERT OR REPLACE INTO records (id, entity, payload, updated_at) VALUES (?, ?, ?, ?)",
                    params![
                        record.id.to_string(),
                        record.entity,
                        serde_json::to_string(&record.payload)?,
                        record.updated_at.timestamp_millis(),
                    ],
                )?;
            }
            RecordChange::Delete { id } => {
                tx.execute("DELETE FROM records WHERE id = ?", [id.to_string()])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let id: String = row.get(0)?;
    let payload: String = row.get(2)?;
    let updated_at: i64 = row.get(3)?;

    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(Record {
        id,
        entity: row.get(1)?,
        payload,
        updated_at: millis_to_datetime(updated_at),
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}
