//! Store manager
//!
//! The handle the application holds. It owns the switch worker, the
//! identity watcher and the import forwarder, and exposes the active store,
//! the events and the operations that change which store is active.
//!
//! Operations only enqueue requests; they return before the work is done.
//! Await [`StoreManager::settle`] to wait for everything queued so far.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ConfigResolver, ResolvedConfig, Settings, StoreConfiguration};
use crate::controller::{ActiveStore, LastWritten, Request, StoreSwitchController, SwitchContext};
use crate::engine::{PersistenceEngine, SqliteEngine, StoreHandle};
use crate::error::{ErrorCause, ErrorContext, StoreError, StoreResult};
use crate::locations::{ContainerLookup, DirectoryContainers, StoreLocations};
use crate::migration::MigrationEngine;
use crate::models::{ImportedChanges, PersistenceState, StoreIdentity};
use crate::preferences::{atomic_write, ManagerPreferences};
use crate::register::{FileRegister, IdentityRegister, MemoryRegister};
use crate::relay::{NotificationRelay, ObserverId, StoreEvent, StoreManagerDelegate};
use crate::seeding::SeedingDecision;
use crate::watcher::CloudIdentityWatcher;

/// Register file shared by every container under the cloud root
pub const REGISTER_FILE: &str = "ubiquity-register.json";

/// File in the data directory naming this device
const DEVICE_ID_FILE: &str = "device_id";

/// Collaborators the coordinator talks to
pub struct ExternalServices {
    pub engine: Arc<dyn PersistenceEngine>,
    pub register: Arc<dyn IdentityRegister>,
    pub containers: Arc<dyn ContainerLookup>,
}

impl ExternalServices {
    /// SQLite engine, file register and directory containers from settings
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let device_id = load_or_create_device_id(&settings.data_dir)?;

        let register: Arc<dyn IdentityRegister> = match &settings.cloud_root {
            Some(root) => {
                let path = root.join(REGISTER_FILE);
                Arc::new(
                    FileRegister::open(&path)
                        .with_context(|| format!("Failed to open register {:?}", path))?,
                )
            }
            None => Arc::new(MemoryRegister::new()),
        };

        Ok(Self {
            engine: Arc::new(SqliteEngine::with_device_id(device_id)),
            register,
            containers: Arc::new(DirectoryContainers::new(settings.cloud_root.clone())),
        })
    }
}

fn load_or_create_device_id(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(DEVICE_ID_FILE);
    if path.exists() {
        let id = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read device id from {:?}", path))?;
        let id = id.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    let id = format!("device-{}", &Uuid::new_v4().simple().to_string()[..12]);
    atomic_write(&path, id.as_bytes())
        .with_context(|| format!("Failed to save device id to {:?}", path))?;
    Ok(id)
}

/// Public facade over the store-switching coordinator
///
/// Keep exactly one manager per local store directory.
pub struct StoreManager {
    config: ResolvedConfig,
    locations: StoreLocations,
    relay: NotificationRelay,
    requests: mpsc::UnboundedSender<Request>,
    active: ActiveStore,
    last_written: LastWritten,
    cloud_enabled: Arc<AtomicBool>,
    migration: Arc<MigrationEngine>,
    tasks: Vec<JoinHandle<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl StoreManager {
    /// Open with settings from the config file and environment and every
    /// store option defaulted
    pub fn open_default() -> Result<Self> {
        let settings = Settings::load()?;
        Self::open_with_settings(&settings, StoreConfiguration::default())
    }

    pub fn open_with_settings(settings: &Settings, overrides: StoreConfiguration) -> Result<Self> {
        let config = ConfigResolver::new(settings).resolve(overrides)?;
        let services = ExternalServices::from_settings(settings)?;
        Ok(Self::new(config, services)?)
    }

    /// Start the coordinator
    ///
    /// The stored cloud preference (or the configured default) is applied
    /// as the first request. Called inside a tokio runtime the identity
    /// watcher and import forwarding start too.
    pub fn new(config: ResolvedConfig, services: ExternalServices) -> StoreResult<Self> {
        let locations = StoreLocations::new(&config, services.containers.as_ref());
        let relay = NotificationRelay::new();

        let preferences = ManagerPreferences::load(&locations.preferences_file())
            .unwrap_or_else(|e| {
                warn!("Ignoring unreadable preferences: {:#}", e);
                ManagerPreferences::default()
            });
        let cloud_enabled = preferences
            .cloud_enabled
            .unwrap_or(config.initial_cloud_enabled);

        let active: ActiveStore = Arc::new(Mutex::new(None));
        let last_written: LastWritten = Arc::new(Mutex::new(preferences.store_identity));
        let cloud_flag = Arc::new(AtomicBool::new(cloud_enabled));
        let migration = Arc::new(MigrationEngine::new(services.engine.clone()));

        let (requests, receiver) = mpsc::unbounded_channel();
        let _ = requests.send(Request::SetCloudEnabled(cloud_enabled));

        let mut tasks = Vec::new();
        match Handle::try_current() {
            Ok(runtime) => {
                if locations.cloud_available() {
                    let watcher = CloudIdentityWatcher::new(
                        services.register.clone(),
                        requests.clone(),
                        last_written.clone(),
                        config.identity_debounce,
                        config.register_poll_interval,
                    );
                    tasks.push(watcher.spawn(&runtime));
                }
                tasks.push(forward_imports(
                    &runtime,
                    services.engine.subscribe_imports(),
                    requests.clone(),
                ));
            }
            Err(_) => {
                warn!("No tokio runtime; identity watching and import forwarding are disabled")
            }
        }

        let controller = StoreSwitchController::new(
            SwitchContext {
                config: config.clone(),
                locations: locations.clone(),
                engine: services.engine,
                register: services.register,
                relay: relay.clone(),
                migration: migration.clone(),
                active: active.clone(),
                last_written: last_written.clone(),
                cloud_enabled: cloud_flag.clone(),
            },
            receiver,
        );
        let worker = match controller.spawn() {
            Ok(worker) => worker,
            Err(e) => {
                for task in &tasks {
                    task.abort();
                }
                return Err(StoreError::WorkerStart(e));
            }
        };

        Ok(Self {
            config,
            locations,
            relay,
            requests,
            active,
            last_written,
            cloud_enabled: cloud_flag,
            migration,
            tasks,
            worker: Some(worker),
        })
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!("Store worker has stopped; request dropped");
        }
    }

    // ===== Delegate & observers =====

    /// Register the import delegate; it is held weakly
    pub fn set_delegate<D>(&self, delegate: &Arc<D>)
    where
        D: StoreManagerDelegate + 'static,
    {
        self.relay.set_delegate(delegate);
    }

    pub fn clear_delegate(&self) {
        self.relay.clear_delegate();
    }

    pub fn on_backend_switched<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.relay.on_backend_switched(observer)
    }

    pub fn on_error<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&StoreError, ErrorCause, &ErrorContext) + Send + Sync + 'static,
    {
        self.relay.on_error(observer)
    }

    pub fn on_log<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.relay.on_log(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.relay.unsubscribe(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.relay.subscribe()
    }

    /// Every state the coordinator enters from now on
    pub fn subscribe_states(&self) -> broadcast::Receiver<PersistenceState> {
        self.relay.subscribe_states()
    }

    // ===== State =====

    pub fn state(&self) -> PersistenceState {
        self.relay.state()
    }

    /// Cloud preference as last applied by the worker
    pub fn cloud_enabled(&self) -> bool {
        self.cloud_enabled.load(Ordering::SeqCst)
    }

    /// Identity of the cloud generation this device last published
    pub fn store_identity(&self) -> Option<StoreIdentity> {
        *self
            .last_written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeding migrations attempted by this manager
    pub fn migration_runs(&self) -> usize {
        self.migration.runs()
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Run `f` against the attached store; `None` when nothing is attached
    pub fn with_store<T>(&self, f: impl FnOnce(&mut dyn StoreHandle) -> T) -> Option<T> {
        let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_mut().map(|store| f(store.as_mut()))
    }

    // ===== Operations =====

    pub fn set_cloud_enabled(&self, enabled: bool) {
        debug!("Requesting cloud enabled = {}", enabled);
        self.send(Request::SetCloudEnabled(enabled));
    }

    /// Wipe the whole cloud container and start a new generation
    pub fn nuke_cloud_container(&self) {
        self.send(Request::NukeCloudContainer);
    }

    pub fn delete_local_store(&self) {
        self.send(Request::DeleteLocalStore);
    }

    /// Delete the current generation's cloud store file, keeping its logs
    pub fn delete_cloud_store(&self) {
        self.send(Request::DeleteCloudStore);
    }

    /// Hand changes imported by some transport to the worker
    pub fn import_changes(&self, changes: ImportedChanges) {
        self.send(Request::Import(changes));
    }

    pub async fn seeding_decision(&self) -> StoreResult<SeedingDecision> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::CheckSeeding(reply))
            .map_err(|_| StoreError::Stopped)?;
        response.await.map_err(|_| StoreError::Stopped)
    }

    pub async fn cloud_safe_for_seeding(&self) -> bool {
        self.seeding_decision()
            .await
            .map(|decision| decision.is_safe())
            .unwrap_or(false)
    }

    /// Wait until every request sent so far has been handled
    pub async fn settle(&self) {
        let (reply, done) = oneshot::channel();
        if self.requests.send(Request::Barrier(reply)).is_ok() {
            let _ = done.await;
        }
    }

    // ===== Locations =====

    pub fn locations(&self) -> &StoreLocations {
        &self.locations
    }

    pub fn cloud_container_path(&self) -> Option<PathBuf> {
        self.locations.cloud_container().map(Path::to_path_buf)
    }

    pub fn cloud_store_directory(&self) -> Option<PathBuf> {
        self.locations.cloud_store_directory()
    }

    /// Cloud store of the current generation
    pub fn cloud_store_path(&self) -> Option<PathBuf> {
        self.store_identity()
            .and_then(|identity| self.locations.cloud_store(&identity))
    }

    pub fn cloud_content_directory(&self) -> Option<PathBuf> {
        self.locations.cloud_content_directory()
    }

    /// Transaction logs of the current generation
    pub fn cloud_content_path(&self) -> Option<PathBuf> {
        self.store_identity()
            .and_then(|identity| self.locations.cloud_content(&identity))
    }

    pub fn local_store_directory(&self) -> PathBuf {
        self.locations.local_store_directory()
    }

    pub fn local_store_path(&self) -> PathBuf {
        self.locations.local_store().to_path_buf()
    }
}

impl Drop for StoreManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Store worker panicked");
            }
        }
    }
}

/// Feed the engine's imports into the worker queue
fn forward_imports(
    runtime: &Handle,
    mut imports: broadcast::Receiver<ImportedChanges>,
    requests: mpsc::UnboundedSender<Request>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        loop {
            match imports.recv().await {
                Ok(changes) => {
                    if requests.send(Request::Import(changes)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} imported change sets", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackendKind;
    use crate::register::STORE_IDENTITY_KEY;
    use crate::seeding::SeedingReason;
    use crate::testing::{
        drain, notes, store_changes, wait_for, Harness, InstrumentedEngine, RecordingContext,
    };
    use std::time::Duration;

    struct Delegate {
        context: Arc<Mutex<RecordingContext>>,
    }

    impl StoreManagerDelegate for Delegate {
        fn context_for_imports(&self) -> Arc<Mutex<dyn crate::engine::DataContext>> {
            self.context.clone()
        }
    }

    fn record_count(manager: &StoreManager) -> u64 {
        manager
            .with_store(|store| store.record_count().unwrap())
            .unwrap()
    }

    fn active_kind(manager: &StoreManager) -> Option<BackendKind> {
        manager.with_store(|store| store.kind())
    }

    /// Local-only manager holding `count` records
    async fn local_manager(
        harness: &Harness,
        engine: &Arc<InstrumentedEngine>,
        count: usize,
    ) -> StoreManager {
        let manager = harness.manager("device-a", engine, false);
        manager.settle().await;
        if count > 0 {
            manager
                .with_store(|store| store.apply(&notes(count)).unwrap())
                .unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn test_starts_local_when_cloud_disabled() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = harness.manager("device-a", &engine, false);

        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::LocalActive);
        assert_eq!(active_kind(&manager), Some(BackendKind::Local));
        assert!(manager.local_store_path().exists());
        assert!(!manager.cloud_enabled());
        assert_eq!(manager.store_identity(), None);
    }

    #[tokio::test]
    async fn test_enabling_cloud_seeds_local_records() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 10).await;
        let mut events = manager.subscribe();
        let mut states = manager.subscribe_states();

        manager.set_cloud_enabled(true);
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::CloudActive);
        assert_eq!(engine.migrations(), 1);
        assert_eq!(manager.migration_runs(), 1);
        assert_eq!(active_kind(&manager), Some(BackendKind::Cloud));
        assert_eq!(record_count(&manager), 10);

        assert_eq!(
            drain(&mut events),
            vec![StoreEvent::StoreDidChange {
                previous: Some(BackendKind::Local),
                current: BackendKind::Cloud,
            }]
        );
        assert_eq!(
            drain(&mut states),
            vec![
                PersistenceState::SwitchingToCloud,
                PersistenceState::CloudActive
            ]
        );

        let identity = manager.store_identity().unwrap();
        assert_eq!(
            harness.register.get(STORE_IDENTITY_KEY).unwrap(),
            Some(identity.to_string())
        );
        assert!(manager.cloud_store_path().unwrap().exists());
    }

    #[tokio::test]
    async fn test_empty_local_store_is_never_migrated() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 0).await;

        manager.set_cloud_enabled(true);
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::CloudActive);
        assert_eq!(engine.migrations(), 0);
        assert_eq!(record_count(&manager), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rapid_toggle_settles_with_one_change() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 0).await;
        let mut events = manager.subscribe();

        engine.pause_cloud_opens();
        manager.set_cloud_enabled(true);
        assert!(engine.wait_until_blocked(Duration::from_secs(5)));

        manager.set_cloud_enabled(false);
        manager.set_cloud_enabled(true);
        engine.resume_cloud_opens();
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::CloudActive);
        assert_eq!(active_kind(&manager), Some(BackendKind::Cloud));
        assert_eq!(
            drain(&mut events),
            vec![StoreEvent::StoreDidChange {
                previous: Some(BackendKind::Local),
                current: BackendKind::Cloud,
            }]
        );
    }

    #[tokio::test]
    async fn test_disabling_cloud_returns_to_local_without_copy() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 2).await;

        manager.set_cloud_enabled(true);
        manager.settle().await;
        manager
            .with_store(|store| store.apply(&notes(3)).unwrap())
            .unwrap();

        manager.set_cloud_enabled(false);
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::LocalActive);
        assert!(!manager.cloud_enabled());
        assert_eq!(record_count(&manager), 2);
    }

    #[tokio::test]
    async fn test_nuke_while_enabled_leaves_empty_cloud_store() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 10).await;
        manager.set_cloud_enabled(true);
        manager.settle().await;
        let old_identity = manager.store_identity().unwrap();
        let old_store = manager.cloud_store_path().unwrap();

        manager.nuke_cloud_container();
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::CloudActive);
        assert_eq!(active_kind(&manager), Some(BackendKind::Cloud));
        assert_eq!(record_count(&manager), 0);
        assert!(!old_store.exists());

        let new_identity = manager.store_identity().unwrap();
        assert_ne!(new_identity, old_identity);
        assert_eq!(
            harness.register.get(STORE_IDENTITY_KEY).unwrap(),
            Some(new_identity.to_string())
        );
        assert_eq!(engine.migrations(), 1);
    }

    #[tokio::test]
    async fn test_nuke_while_disabled_clears_identity() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 1).await;
        manager.set_cloud_enabled(true);
        manager.settle().await;
        manager.set_cloud_enabled(false);
        manager.settle().await;

        manager.nuke_cloud_container();
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::LocalActive);
        assert_eq!(manager.store_identity(), None);
        assert_eq!(harness.register.get(STORE_IDENTITY_KEY).unwrap(), None);
        assert!(!manager.cloud_store_directory().unwrap().exists());
        assert_eq!(record_count(&manager), 1);
    }

    #[tokio::test]
    async fn test_foreign_identity_repoints_without_migration() {
        let harness = Harness::new();
        let engine_a = InstrumentedEngine::new("device-a");
        let device_a = local_manager(&harness, &engine_a, 3).await;
        device_a.set_cloud_enabled(true);
        device_a.settle().await;

        // Device B joins the dataset device A seeded
        let engine_b = InstrumentedEngine::new("device-b");
        let device_b = harness.manager("device-b", &engine_b, true);
        device_b.settle().await;
        assert_eq!(device_b.state(), PersistenceState::CloudActive);
        assert_eq!(device_b.store_identity(), device_a.store_identity());
        assert_eq!(record_count(&device_b), 3);

        device_a.nuke_cloud_container();
        device_a.settle().await;
        let new_identity = device_a.store_identity();

        assert!(wait_for(|| device_b.store_identity() == new_identity).await);
        device_b.settle().await;

        assert_eq!(device_b.state(), PersistenceState::CloudActive);
        assert_eq!(record_count(&device_b), 0);
        assert_eq!(engine_b.migrations(), 0);
    }

    #[tokio::test]
    async fn test_repoint_ignored_while_disabled() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 0).await;
        let mut events = manager.subscribe();

        harness
            .register
            .set(STORE_IDENTITY_KEY, &StoreIdentity::new().to_string())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::LocalActive);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_cloud_permission_error_falls_back_to_local() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 0).await;
        let mut events = manager.subscribe();
        let mut states = manager.subscribe_states();

        let causes = Arc::new(Mutex::new(Vec::new()));
        let sink = causes.clone();
        manager.on_error(move |_, cause, _| sink.lock().unwrap().push(cause));

        engine.fail_cloud_opens(true);
        manager.set_cloud_enabled(true);
        manager.settle().await;

        assert_eq!(*causes.lock().unwrap(), vec![ErrorCause::OpenCloudStore]);
        assert_eq!(manager.state(), PersistenceState::LocalActive);
        assert_eq!(active_kind(&manager), Some(BackendKind::Local));
        assert!(store_changes(&drain(&mut events)).is_empty());
        assert_eq!(
            drain(&mut states),
            vec![
                PersistenceState::SwitchingToCloud,
                PersistenceState::Failed,
                PersistenceState::LocalActive
            ]
        );
    }

    #[tokio::test]
    async fn test_cloud_failure_at_startup_opens_local() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        engine.fail_cloud_opens(true);

        let manager = harness.manager("device-a", &engine, true);
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::LocalActive);
        assert_eq!(active_kind(&manager), Some(BackendKind::Local));
        assert!(manager.cloud_enabled());
        assert_eq!(manager.store_identity(), None);
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_local_store() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 5).await;

        let causes = Arc::new(Mutex::new(Vec::new()));
        let sink = causes.clone();
        manager.on_error(move |_, cause, _| sink.lock().unwrap().push(cause));

        engine.fail_migrations(true);
        manager.set_cloud_enabled(true);
        manager.settle().await;

        assert_eq!(
            *causes.lock().unwrap(),
            vec![ErrorCause::MigrateLocalToCloudStore]
        );
        assert_eq!(engine.migrations(), 1);
        assert_eq!(manager.state(), PersistenceState::LocalActive);
        assert_eq!(active_kind(&manager), Some(BackendKind::Local));
        assert_eq!(record_count(&manager), 5);
        assert_eq!(manager.store_identity(), None);
        assert_eq!(harness.register.get(STORE_IDENTITY_KEY).unwrap(), None);

        // The partial cloud store and its logs are gone
        let stores = fs::read_dir(manager.cloud_store_directory().unwrap()).unwrap();
        assert_eq!(stores.count(), 0);
        let logs = manager.cloud_content_directory().unwrap();
        assert!(!logs.exists() || fs::read_dir(&logs).unwrap().count() == 0);
    }

    #[tokio::test]
    async fn test_losing_both_stores_leaves_no_store() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 1).await;
        manager.set_cloud_enabled(true);
        manager.settle().await;

        let causes = Arc::new(Mutex::new(Vec::new()));
        let sink = causes.clone();
        manager.on_error(move |_, cause, _| sink.lock().unwrap().push(cause));

        engine.fail_cloud_opens(true);
        engine.fail_local_opens(true);
        manager.nuke_cloud_container();
        manager.settle().await;

        assert_eq!(
            *causes.lock().unwrap(),
            vec![ErrorCause::OpenCloudStore, ErrorCause::OpenLocalStore]
        );
        assert_eq!(manager.state(), PersistenceState::Failed);
        assert!(manager.with_store(|store| store.kind()).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reenable_follows_identity_changed_mid_switch() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 2).await;
        manager.set_cloud_enabled(true);
        manager.settle().await;
        let seeded = manager.store_identity().unwrap();

        // Another device resets the cloud while our repoint is held open
        engine.pause_cloud_opens();
        let foreign = StoreIdentity::new();
        harness
            .register
            .set(STORE_IDENTITY_KEY, &foreign.to_string())
            .unwrap();
        assert!(engine.wait_until_blocked(Duration::from_secs(5)));

        manager.set_cloud_enabled(true);
        engine.resume_cloud_opens();
        assert!(wait_for(|| manager.store_identity() == Some(foreign)).await);
        manager.settle().await;

        assert_ne!(foreign, seeded);
        assert_eq!(manager.state(), PersistenceState::CloudActive);
        let expected = manager.locations().cloud_store(&foreign).unwrap();
        assert_eq!(manager.cloud_store_path(), Some(expected.clone()));
        assert_eq!(
            manager.with_store(|store| store.path().to_path_buf()),
            Some(expected)
        );
        assert_eq!(record_count(&manager), 0);
        assert_eq!(engine.migrations(), 1);
    }

    #[tokio::test]
    async fn test_imports_reach_delegate_while_cloud_active() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 0).await;
        manager.set_cloud_enabled(true);
        manager.settle().await;
        let mut events = manager.subscribe();

        let context = Arc::new(Mutex::new(RecordingContext::default()));
        let delegate = Arc::new(Delegate {
            context: context.clone(),
        });
        manager.set_delegate(&delegate);

        engine.announce_import(ImportedChanges::new("device-b", notes(2)));
        assert!(wait_for(|| context.lock().unwrap().saves == 1).await);
        manager.settle().await;

        assert_eq!(context.lock().unwrap().applied.len(), 2);
        assert_eq!(
            drain(&mut events),
            vec![StoreEvent::StoreDidImportChanges {
                origin: "device-b".to_string(),
                count: 2,
            }]
        );

        manager.clear_delegate();
        manager.import_changes(ImportedChanges::new("device-b", notes(1)));
        manager.settle().await;
        assert_eq!(context.lock().unwrap().applied.len(), 2);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_imports_dropped_while_local() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 0).await;

        let context = Arc::new(Mutex::new(RecordingContext::default()));
        let delegate = Arc::new(Delegate {
            context: context.clone(),
        });
        manager.set_delegate(&delegate);

        manager.import_changes(ImportedChanges::new("device-b", notes(1)));
        manager.settle().await;

        assert!(context.lock().unwrap().applied.is_empty());
    }

    #[tokio::test]
    async fn test_failed_import_save_is_reported() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 0).await;
        manager.set_cloud_enabled(true);
        manager.settle().await;
        let mut events = manager.subscribe();

        let causes = Arc::new(Mutex::new(Vec::new()));
        let sink = causes.clone();
        manager.on_error(move |_, cause, _| sink.lock().unwrap().push(cause));

        let delegate = Arc::new(Delegate {
            context: Arc::new(Mutex::new(RecordingContext::failing_saves())),
        });
        manager.set_delegate(&delegate);

        manager.import_changes(ImportedChanges::new("device-b", notes(2)));
        manager.settle().await;

        assert_eq!(*causes.lock().unwrap(), vec![ErrorCause::ImportChanges]);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_delete_local_store_keeps_state() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 2).await;
        manager.set_cloud_enabled(true);
        manager.settle().await;

        manager.delete_local_store();
        manager.settle().await;

        assert!(!manager.local_store_path().exists());
        assert_eq!(manager.state(), PersistenceState::CloudActive);
    }

    #[tokio::test]
    async fn test_delete_cloud_store_removes_current_generation() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 2).await;
        manager.set_cloud_enabled(true);
        manager.settle().await;
        let store = manager.cloud_store_path().unwrap();
        let logs = manager.cloud_content_path().unwrap();

        manager.delete_cloud_store();
        manager.settle().await;

        assert!(!store.exists());
        assert!(logs.exists());
        assert_eq!(manager.state(), PersistenceState::CloudActive);
    }

    #[tokio::test]
    async fn test_seeding_decision_follows_state() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 5).await;

        assert!(manager.cloud_safe_for_seeding().await);

        manager.set_cloud_enabled(true);
        let decision = manager.seeding_decision().await.unwrap();
        assert_eq!(decision.reason, SeedingReason::CloudStoreExists);
        assert!(!manager.cloud_safe_for_seeding().await);
    }

    #[tokio::test]
    async fn test_no_container_stays_local() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let mut settings = harness.settings("device-a");
        settings.container_identity = None;
        settings.cloud_enabled = true;
        let config = ConfigResolver::new(&settings)
            .resolve(StoreConfiguration::named("Notes"))
            .unwrap();

        let manager = StoreManager::new(config, harness.services(&engine)).unwrap();
        manager.settle().await;

        assert_eq!(manager.state(), PersistenceState::LocalActive);
        assert!(manager.cloud_container_path().is_none());
        assert_eq!(
            manager.seeding_decision().await.unwrap().reason,
            SeedingReason::CloudUnavailable
        );
    }

    #[tokio::test]
    async fn test_preferences_survive_restart() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let identity = {
            let manager = local_manager(&harness, &engine, 4).await;
            manager.set_cloud_enabled(true);
            manager.settle().await;
            manager.store_identity()
        };

        let manager = harness.manager("device-a", &engine, false);
        manager.settle().await;

        assert!(manager.cloud_enabled());
        assert_eq!(manager.state(), PersistenceState::CloudActive);
        assert_eq!(manager.store_identity(), identity);
        assert_eq!(record_count(&manager), 4);
        assert_eq!(engine.migrations(), 1);
    }

    #[tokio::test]
    async fn test_backend_switched_observer() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = local_manager(&harness, &engine, 0).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = manager.on_backend_switched(move |cloud| sink.lock().unwrap().push(cloud));

        manager.set_cloud_enabled(true);
        manager.settle().await;
        manager.set_cloud_enabled(false);
        manager.settle().await;
        assert!(manager.unsubscribe(id));
        manager.set_cloud_enabled(true);
        manager.settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_device_id_is_stable() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let first = load_or_create_device_id(temp_dir.path()).unwrap();
        let second = load_or_create_device_id(temp_dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("device-"));
    }

    #[test]
    fn test_manager_without_runtime() {
        let harness = Harness::new();
        let engine = InstrumentedEngine::new("device-a");
        let manager = harness.manager("device-a", &engine, false);
        drop(manager);
        assert!(harness
            .temp
            .path()
            .join("device-a")
            .join("Notes.preferences.toml")
            .exists());
    }
}
