//! Seeding the cloud store from the local store

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::{store_files, PersistenceEngine, StoreHandle, StoreOptions};
use crate::error::{StoreError, StoreResult};
use crate::relay::NotificationRelay;

/// Copies the local store into a new cloud store
///
/// The copy is all or nothing: on failure the partial target is removed and
/// the source is left exactly as it was.
pub struct MigrationEngine {
    engine: Arc<dyn PersistenceEngine>,
    runs: AtomicUsize,
}

impl MigrationEngine {
    pub fn new(engine: Arc<dyn PersistenceEngine>) -> Self {
        Self {
            engine,
            runs: AtomicUsize::new(0),
        }
    }

    /// Number of migrations attempted so far
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn migrate(
        &self,
        source: &dyn StoreHandle,
        target: &Path,
        options: &StoreOptions,
        relay: &NotificationRelay,
    ) -> StoreResult<Box<dyn StoreHandle>> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if target.exists() {
            return Err(StoreError::TargetExists {
                path: target.to_path_buf(),
            });
        }

        let log_existed = options
            .transaction_log
            .as_ref()
            .map_or(false, |dir| dir.exists());

        let result = self
            .engine
            .migrate_store(source, target, options, &mut |line: &str| relay.log(line));

        match result {
            Ok(store) => {
                info!("Seeded cloud store {:?} from {:?}", target, source.path());
                Ok(store)
            }
            Err(e) => {
                warn!("Migration into {:?} failed, removing partial store", target);
                remove_partial(target, options, log_existed);
                Err(e.into())
            }
        }
    }
}

fn remove_partial(target: &Path, options: &StoreOptions, log_existed: bool) {
    for file in store_files(target) {
        if file.exists() {
            if let Err(e) = fs::remove_file(&file) {
                warn!("Failed to remove {:?}: {}", file, e);
            }
        }
    }

    if log_existed {
        return;
    }
    if let Some(dir) = options.transaction_log.as_ref().filter(|dir| dir.exists()) {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("Failed to remove {:?}: {}", dir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaReference;
    use crate::engine::SqliteEngine;
    use crate::models::{BackendKind, Record, RecordChange};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn options(log_dir: &Path) -> StoreOptions {
        StoreOptions {
            schema: SchemaReference::named("Notes"),
            transaction_log: Some(log_dir.to_path_buf()),
            ..StoreOptions::default()
        }
    }

    fn local_with(temp_dir: &TempDir, engine: &SqliteEngine, count: usize) -> Box<dyn StoreHandle> {
        let mut store = engine
            .open_store(
                &temp_dir.path().join("local.sqlite"),
                BackendKind::Local,
                &options(&temp_dir.path().join("unused")),
            )
            .unwrap();
        let changes: Vec<RecordChange> = (0..count)
            .map(|i| RecordChange::Upsert(Record::new("note", serde_json::json!({ "n": i }))))
            .collect();
        store.apply(&changes).unwrap();
        store
    }

    #[test]
    fn test_migrate_creates_target_directory() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(SqliteEngine::with_device_id("test"));
        let local = local_with(&temp_dir, &engine, 5);

        let relay = NotificationRelay::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        relay.on_log(move |line| sink.lock().unwrap().push(line.to_string()));

        let migration = MigrationEngine::new(engine.clone());
        let target = temp_dir.path().join("cloud").join("store").join("Notes.sqlite");
        let cloud = migration
            .migrate(
                local.as_ref(),
                &target,
                &options(&temp_dir.path().join("logs")),
                &relay,
            )
            .unwrap();

        assert_eq!(cloud.record_count().unwrap(), 5);
        assert_eq!(migration.runs(), 1);
        assert!(!lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_existing_target_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(SqliteEngine::with_device_id("test"));
        let local = local_with(&temp_dir, &engine, 1);

        let target = temp_dir.path().join("Notes-cloud.sqlite");
        fs::write(&target, b"existing").unwrap();

        let migration = MigrationEngine::new(engine.clone());
        let result = migration.migrate(
            local.as_ref(),
            &target,
            &options(&temp_dir.path().join("logs")),
            &NotificationRelay::new(),
        );

        assert!(matches!(result, Err(StoreError::TargetExists { .. })));
        assert_eq!(fs::read(&target).unwrap(), b"existing");
    }

    #[test]
    fn test_failed_migration_leaves_no_target() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(SqliteEngine::with_device_id("test"));
        let local = local_with(&temp_dir, &engine, 3);

        // A file where the log directory should go makes the copy fail
        let log_dir = temp_dir.path().join("logs");
        fs::write(&log_dir, b"").unwrap();

        let target = temp_dir.path().join("cloud").join("Notes.sqlite");
        let migration = MigrationEngine::new(engine.clone());
        let result = migration.migrate(local.as_ref(), &target, &options(&log_dir), &NotificationRelay::new());

        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(local.record_count().unwrap(), 3);
    }
}
