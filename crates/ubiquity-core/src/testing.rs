//! Test support: an instrumented engine and manager fixtures

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::config::{ConfigResolver, ResolvedConfig, Settings, StoreConfiguration};
use crate::engine::{
    DataContext, EngineError, EngineResult, PersistenceEngine, SqliteEngine, StoreHandle,
    StoreOptions,
};
use crate::locations::DirectoryContainers;
use crate::manager::{ExternalServices, StoreManager};
use crate::models::{BackendKind, ImportedChanges, Record, RecordChange};
use crate::register::MemoryRegister;
use crate::relay::StoreEvent;

pub(crate) const CONTAINER: &str = "iCloud.com.example.notes";

#[derive(Default)]
struct Gate {
    paused: bool,
    blocked: usize,
}

/// [`SqliteEngine`] with counters, failure injection and a pause gate
pub(crate) struct InstrumentedEngine {
    inner: SqliteEngine,
    migrations: AtomicUsize,
    fail_cloud_opens: AtomicBool,
    fail_local_opens: AtomicBool,
    fail_migrations: AtomicBool,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
}

impl InstrumentedEngine {
    pub(crate) fn new(device_id: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteEngine::with_device_id(device_id),
            migrations: AtomicUsize::new(0),
            fail_cloud_opens: AtomicBool::new(false),
            fail_local_opens: AtomicBool::new(false),
            fail_migrations: AtomicBool::new(false),
            gate: Mutex::new(Gate::default()),
            gate_changed: Condvar::new(),
        })
    }

    pub(crate) fn migrations(&self) -> usize {
        self.migrations.load(Ordering::SeqCst)
    }

    /// Make cloud opens fail with a permission error
    pub(crate) fn fail_cloud_opens(&self, fail: bool) {
        self.fail_cloud_opens.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_local_opens(&self, fail: bool) {
        self.fail_local_opens.store(fail, Ordering::SeqCst);
    }

    /// Make migrations fail after writing the whole target
    pub(crate) fn fail_migrations(&self, fail: bool) {
        self.fail_migrations.store(fail, Ordering::SeqCst);
    }

    /// Hold every cloud open and migration until resumed
    pub(crate) fn pause_cloud_opens(&self) {
        self.gate.lock().unwrap().paused = true;
    }

    pub(crate) fn resume_cloud_opens(&self) {
        self.gate.lock().unwrap().paused = false;
        self.gate_changed.notify_all();
    }

    /// Wait until some thread is held at the gate
    pub(crate) fn wait_until_blocked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock().unwrap();
        while gate.blocked == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            gate = self.gate_changed.wait_timeout(gate, deadline - now).unwrap().0;
        }
        true
    }

    pub(crate) fn announce_import(&self, changes: ImportedChanges) -> usize {
        self.inner.announce_import(changes)
    }

    fn checkpoint(&self) {
        let mut gate = self.gate.lock().unwrap();
        if !gate.paused {
            return;
        }
        gate.blocked += 1;
        self.gate_changed.notify_all();
        while gate.paused {
            gate = self.gate_changed.wait(gate).unwrap();
        }
        gate.blocked -= 1;
    }
}

impl PersistenceEngine for InstrumentedEngine {
    fn open_store(
        &self,
        path: &Path,
        kind: BackendKind,
        options: &StoreOptions,
    ) -> EngineResult<Box<dyn StoreHandle>> {
        let failing = match kind {
            BackendKind::Cloud => {
                self.checkpoint();
                &self.fail_cloud_opens
            }
            BackendKind::Local => &self.fail_local_opens,
        };
        if failing.load(Ordering::SeqCst) {
            return Err(EngineError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        self.inner.open_store(path, kind, options)
    }

    fn migrate_store(
        &self,
        source: &dyn StoreHandle,
        target: &Path,
        options: &StoreOptions,
        progress: &mut dyn FnMut(&str),
    ) -> EngineResult<Box<dyn StoreHandle>> {
        self.migrations.fetch_add(1, Ordering::SeqCst);
        self.checkpoint();
        let store = self.inner.migrate_store(source, target, options, progress)?;
        if self.fail_migrations.load(Ordering::SeqCst) {
            store.close()?;
            return Err(EngineError::PermissionDenied {
                path: target.to_path_buf(),
            });
        }
        Ok(store)
    }

    fn merge_changes(
        &self,
        changes: &ImportedChanges,
        context: &mut dyn DataContext,
    ) -> EngineResult<()> {
        self.inner.merge_changes(changes, context)
    }

    fn subscribe_imports(&self) -> broadcast::Receiver<ImportedChanges> {
        self.inner.subscribe_imports()
    }
}

/// Data context that records what was merged into it
#[derive(Default)]
pub(crate) struct RecordingContext {
    pub applied: Vec<RecordChange>,
    pub saves: usize,
    pub fail_saves: bool,
}

impl RecordingContext {
    pub(crate) fn failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }
}

impl DataContext for RecordingContext {
    fn apply_change(&mut self, change: &RecordChange) -> anyhow::Result<()> {
        self.applied.push(change.clone());
        Ok(())
    }

    fn save(&mut self) -> anyhow::Result<()> {
        if self.fail_saves {
            anyhow::bail!("disk is read-only");
        }
        self.saves += 1;
        Ok(())
    }
}

/// Temp directories and a register shared by simulated devices
pub(crate) struct Harness {
    pub temp: TempDir,
    pub register: MemoryRegister,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            register: MemoryRegister::new(),
        }
    }

    pub(crate) fn cloud_root(&self) -> PathBuf {
        self.temp.path().join("containers")
    }

    pub(crate) fn settings(&self, device: &str) -> Settings {
        Settings {
            data_dir: self.temp.path().join(device),
            cloud_root: Some(self.cloud_root()),
            container_identity: Some(CONTAINER.to_string()),
            schemas: vec!["Note".to_string()],
            identity_debounce_ms: 20,
            register_poll_ms: 0,
            ..Settings::default()
        }
    }

    pub(crate) fn config(&self, device: &str, cloud_enabled: bool) -> ResolvedConfig {
        let mut settings = self.settings(device);
        settings.cloud_enabled = cloud_enabled;
        ConfigResolver::new(&settings)
            .resolve(StoreConfiguration::named("Notes"))
            .unwrap()
    }

    pub(crate) fn services(&self, engine: &Arc<InstrumentedEngine>) -> ExternalServices {
        ExternalServices {
            engine: engine.clone(),
            register: Arc::new(self.register.clone()),
            containers: Arc::new(DirectoryContainers::new(Some(self.cloud_root()))),
        }
    }

    pub(crate) fn manager(
        &self,
        device: &str,
        engine: &Arc<InstrumentedEngine>,
        cloud_enabled: bool,
    ) -> StoreManager {
        StoreManager::new(self.config(device, cloud_enabled), self.services(engine)).unwrap()
    }
}

pub(crate) fn notes(count: usize) -> Vec<RecordChange> {
    (0..count)
        .map(|i| {
            RecordChange::Upsert(Record::new(
                "note",
                serde_json::json!({ "title": format!("Note {}", i) }),
            ))
        })
        .collect()
}

pub(crate) fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

pub(crate) fn store_changes(events: &[StoreEvent]) -> Vec<&StoreEvent> {
    events
        .iter()
        .filter(|event| matches!(event, StoreEvent::StoreDidChange { .. }))
        .collect()
}

/// Poll `condition` until it holds or five seconds pass
pub(crate) async fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
