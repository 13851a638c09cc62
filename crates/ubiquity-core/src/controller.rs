//! Store switch controller
//!
//! The one place the coordinator's state changes. All requests arrive on a
//! single channel and run one at a time on the `ubiquity-switch` thread, so
//! backend opens and migrations never block the application.
//!
//! Every transition runs in three steps:
//!
//! 1. **prepare**: open (and for seeding, migrate into) the target store
//!    while the current store stays attached
//! 2. **supersession check**: if a newer transition is already queued the
//!    prepared store is closed and the previous state restored
//! 3. **commit**: swap the stores, record and publish the identity,
//!    persist preferences and announce the change
//!
//! A failed cloud transition falls back to the local store.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::engine::{PersistenceEngine, StoreHandle, StoreOptions};
use crate::error::{ErrorCause, ErrorContext, StoreError};
use crate::lifecycle::{self, DeleteFailures};
use crate::locations::StoreLocations;
use crate::migration::MigrationEngine;
use crate::models::{BackendKind, ImportedChanges, PersistenceState, StoreIdentity};
use crate::preferences::ManagerPreferences;
use crate::register::{IdentityRegister, STORE_IDENTITY_KEY};
use crate::relay::NotificationRelay;
use crate::seeding::{SeedingDecision, SeedingInputs, SeedingSafetyChecker};

/// Slot holding the attached store
pub(crate) type ActiveStore = Arc<Mutex<Option<Box<dyn StoreHandle>>>>;

/// Identity this device last wrote to the register
pub(crate) type LastWritten = Arc<Mutex<Option<StoreIdentity>>>;

pub(crate) enum Request {
    SetCloudEnabled(bool),
    /// Another device published a new store identity
    Repoint(StoreIdentity),
    NukeCloudContainer,
    DeleteLocalStore,
    DeleteCloudStore,
    Import(ImportedChanges),
    CheckSeeding(oneshot::Sender<SeedingDecision>),
    /// Answered once every earlier request has run
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

impl Request {
    fn is_transition(&self) -> bool {
        matches!(self, Request::SetCloudEnabled(_) | Request::Repoint(_))
    }
}

/// Everything the controller shares with the manager
pub(crate) struct SwitchContext {
    pub config: ResolvedConfig,
    pub locations: StoreLocations,
    pub engine: Arc<dyn PersistenceEngine>,
    pub register: Arc<dyn IdentityRegister>,
    pub relay: NotificationRelay,
    pub migration: Arc<MigrationEngine>,
    pub active: ActiveStore,
    pub last_written: LastWritten,
    pub cloud_enabled: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Local,
    /// Enable the cloud: adopt, reuse or seed a generation
    Cloud,
    /// Attach an existing generation without seeding
    Repoint(StoreIdentity),
    /// Attach a brand new, empty generation
    Fresh(StoreIdentity),
}

impl Target {
    fn kind(&self) -> BackendKind {
        match self {
            Target::Local => BackendKind::Local,
            _ => BackendKind::Cloud,
        }
    }
}

struct Prepared {
    kind: BackendKind,
    handle: Box<dyn StoreHandle>,
    identity: Option<StoreIdentity>,
}

struct Failure {
    error: StoreError,
    cause: ErrorCause,
    context: ErrorContext,
}

impl Failure {
    fn new(error: impl Into<StoreError>, cause: ErrorCause, context: ErrorContext) -> Self {
        Self {
            error: error.into(),
            cause,
            context,
        }
    }
}

pub(crate) struct StoreSwitchController {
    ctx: SwitchContext,
    requests: mpsc::UnboundedReceiver<Request>,
    backlog: VecDeque<Request>,
    attached: Option<BackendKind>,
    attached_identity: Option<StoreIdentity>,
    /// Identity chosen by a cloud transition that has not committed yet
    pending_identity: Option<StoreIdentity>,
}

impl StoreSwitchController {
    pub(crate) fn new(ctx: SwitchContext, requests: mpsc::UnboundedReceiver<Request>) -> Self {
        Self {
            ctx,
            requests,
            backlog: VecDeque::new(),
            attached: None,
            attached_identity: None,
            pending_identity: None,
        }
    }

    /// Run the controller on its own thread
    pub(crate) fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("ubiquity-switch".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        debug!("Store switch worker started");

        while let Some(request) = self.next_request() {
            if matches!(request, Request::Shutdown) {
                break;
            }
            self.handle(request);
        }

        self.detach();
        self.ctx.relay.set_state(PersistenceState::Uninitialized);
        debug!("Store switch worker stopped");
    }

    // ===== Queue =====

    fn next_request(&mut self) -> Option<Request> {
        self.drain();
        if self.backlog.is_empty() {
            let request = self.requests.blocking_recv()?;
            self.backlog.push_back(request);
            self.drain();
        }
        coalesce(&mut self.backlog);
        self.backlog.pop_front()
    }

    fn drain(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            self.backlog.push_back(request);
        }
    }

    /// Whether a newer transition is waiting
    fn superseded(&mut self) -> bool {
        self.drain();
        self.backlog.iter().any(Request::is_transition)
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::SetCloudEnabled(enabled) => self.set_cloud_enabled(enabled),
            Request::Repoint(identity) => self.repoint(identity),
            Request::NukeCloudContainer => self.nuke_cloud_container(),
            Request::DeleteLocalStore => self.delete_local_store(),
            Request::DeleteCloudStore => self.delete_cloud_store(),
            Request::Import(changes) => self.import(changes),
            Request::CheckSeeding(reply) => {
                let _ = reply.send(self.seeding_decision());
            }
            Request::Barrier(reply) => {
                let _ = reply.send(());
            }
            Request::Shutdown => {}
        }
    }

    // ===== Requests =====

    fn set_cloud_enabled(&mut self, enabled: bool) {
        self.ctx.cloud_enabled.store(enabled, Ordering::SeqCst);

        let target = if enabled && self.ctx.locations.cloud_available() {
            Target::Cloud
        } else {
            if enabled {
                warn!("Cloud enabled but no cloud container is available; using local store");
                self.ctx.relay.log("No cloud container available");
            }
            Target::Local
        };

        if self.attached == Some(target.kind()) {
            if let Some(identity) = self.unattached_cloud_identity(&target) {
                info!("Cloud store identity moved to {}; re-pointing", identity);
                self.transition(Target::Repoint(identity));
                return;
            }
            self.save_preferences();
            return;
        }
        self.transition(target);
    }

    /// A registered identity the attached cloud store does not match yet
    ///
    /// A repoint can be discarded or coalesced away behind an enable request,
    /// so re-enabling the attached cloud store re-checks the register.
    fn unattached_cloud_identity(&self, target: &Target) -> Option<StoreIdentity> {
        if !matches!(target, Target::Cloud) {
            return None;
        }
        self.registered_identity()
            .filter(|identity| self.attached_identity != Some(*identity))
    }

    fn repoint(&mut self, identity: StoreIdentity) {
        if !self.ctx.cloud_enabled.load(Ordering::SeqCst) {
            self.ctx
                .relay
                .log(&format!("Ignoring cloud identity {} while cloud is disabled", identity));
            return;
        }
        if self.attached == Some(BackendKind::Cloud) && self.attached_identity == Some(identity) {
            return;
        }
        if !self.ctx.locations.cloud_available() {
            return;
        }

        info!("Re-pointing cloud store to identity {}", identity);
        self.transition(Target::Repoint(identity));
    }

    fn nuke_cloud_container(&mut self) {
        let enabled = self.ctx.cloud_enabled.load(Ordering::SeqCst);

        if self.attached == Some(BackendKind::Cloud) {
            self.detach();
            self.ctx.relay.set_state(PersistenceState::Uninitialized);
        }

        let directories = [
            self.ctx.locations.cloud_store_directory(),
            self.ctx.locations.cloud_content_directory(),
        ];
        for dir in directories.into_iter().flatten() {
            self.report_deletions(lifecycle::delete_directory(&dir));
        }

        *self.lock_last_written() = None;
        self.pending_identity = None;
        if let Err(e) = self.ctx.register.remove(STORE_IDENTITY_KEY) {
            warn!("Failed to clear store identity: {}", e);
        }
        self.ctx.relay.log("Cloud container wiped");

        if enabled && self.ctx.locations.cloud_available() {
            self.transition(Target::Fresh(StoreIdentity::new()));
        } else if self.attached != Some(BackendKind::Local) {
            self.transition(Target::Local);
        } else {
            self.save_preferences();
        }
    }

    fn delete_local_store(&mut self) {
        let path = self.ctx.locations.local_store().to_path_buf();
        self.ctx
            .relay
            .log(&format!("Deleting local store {:?}", path));
        self.report_deletions(lifecycle::delete_store(&path));
    }

    fn delete_cloud_store(&mut self) {
        let identity = self.attached_identity.or_else(|| self.last_written());
        let Some(path) = identity.and_then(|id| self.ctx.locations.cloud_store(&id)) else {
            self.ctx.relay.log("No cloud store to delete");
            return;
        };

        self.ctx
            .relay
            .log(&format!("Deleting cloud store {:?}", path));
        self.report_deletions(lifecycle::delete_store(&path));
    }

    fn import(&mut self, changes: ImportedChanges) {
        if self.attached != Some(BackendKind::Cloud) {
            self.ctx.relay.log(&format!(
                "Dropping {} imported changes from {}: cloud store is not active",
                changes.len(),
                changes.origin
            ));
            return;
        }
        self.ctx
            .relay
            .import_changes(self.ctx.engine.as_ref(), &changes);
    }

    fn seeding_decision(&self) -> SeedingDecision {
        let registered = self.registered_identity();
        let last_written = self.last_written();
        let candidate = registered.or(last_written).or(self.pending_identity);

        let cloud_store_exists = candidate
            .and_then(|id| self.ctx.locations.cloud_store(&id))
            .map_or(false, |path| path.exists());
        let local_record_count = self
            .open_local_source()
            .and_then(|source| source.record_count().ok());

        SeedingSafetyChecker::evaluate(&SeedingInputs {
            cloud_available: self.ctx.locations.cloud_available(),
            cloud_store_exists,
            local_record_count,
            registered_identity: registered,
            last_written_identity: last_written,
        })
    }

    // ===== Transitions =====

    fn transition(&mut self, target: Target) {
        let before = self.ctx.relay.state();
        self.ctx.relay.set_state(match target.kind() {
            BackendKind::Local => PersistenceState::SwitchingToLocal,
            BackendKind::Cloud => PersistenceState::SwitchingToCloud,
        });

        let prepared = match self.prepare(target) {
            Ok(prepared) => prepared,
            Err(failure) => {
                self.fail(failure, target.kind());
                return;
            }
        };

        if self.superseded() {
            self.discard(prepared, before);
            return;
        }

        self.commit(prepared);
    }

    fn prepare(&mut self, target: Target) -> Result<Prepared, Failure> {
        match target {
            Target::Local => self.prepare_local(),
            Target::Cloud => self.prepare_cloud(),
            Target::Repoint(identity) | Target::Fresh(identity) => {
                self.pending_identity = Some(identity);
                let (store_path, content_path) = self.cloud_paths(&identity)?;
                self.ensure_cloud_directories()?;
                let handle = self.open_cloud_store(&store_path, content_path)?;
                Ok(Prepared {
                    kind: BackendKind::Cloud,
                    handle,
                    identity: Some(identity),
                })
            }
        }
    }

    fn prepare_local(&mut self) -> Result<Prepared, Failure> {
        let path = self.ctx.locations.local_store().to_path_buf();
        ensure_directory(&self.ctx.locations.local_store_directory())?;

        let handle = self
            .ctx
            .engine
            .open_store(&path, BackendKind::Local, &self.store_options(None))
            .map_err(|e| {
                Failure::new(
                    e,
                    ErrorCause::OpenLocalStore,
                    ErrorContext::Store {
                        kind: BackendKind::Local,
                        path: path.clone(),
                    },
                )
            })?;

        Ok(Prepared {
            kind: BackendKind::Local,
            handle,
            identity: None,
        })
    }

    /// Pick the generation to attach and seed it when that is safe
    fn prepare_cloud(&mut self) -> Result<Prepared, Failure> {
        let registered = self.registered_identity();
        let last_written = self.last_written();
        let identity = registered
            .or(last_written)
            .or(self.pending_identity)
            .unwrap_or_else(StoreIdentity::new);
        self.pending_identity = Some(identity);

        let (store_path, content_path) = self.cloud_paths(&identity)?;
        self.ensure_cloud_directories()?;

        let source = self.open_local_source();
        let decision = SeedingSafetyChecker::evaluate(&SeedingInputs {
            cloud_available: true,
            cloud_store_exists: store_path.exists(),
            local_record_count: source.as_ref().and_then(|s| s.record_count().ok()),
            registered_identity: registered,
            last_written_identity: last_written,
        });
        self.ctx.relay.log(&format!(
            "Cloud store {}: {}",
            identity, decision.reason
        ));

        let handle = match source.as_deref() {
            Some(source) if decision.is_safe() => {
                let options = self.store_options(Some(content_path));
                self.ctx
                    .migration
                    .migrate(source, &store_path, &options, &self.ctx.relay)
                    .map_err(|e| {
                        Failure::new(
                            e,
                            ErrorCause::MigrateLocalToCloudStore,
                            ErrorContext::Store {
                                kind: BackendKind::Cloud,
                                path: store_path.clone(),
                            },
                        )
                    })?
            }
            _ => self.open_cloud_store(&store_path, content_path)?,
        };

        if let Some(source) = source {
            if let Err(e) = source.close() {
                warn!("Failed to close local store after seeding check: {}", e);
            }
        }

        Ok(Prepared {
            kind: BackendKind::Cloud,
            handle,
            identity: Some(identity),
        })
    }

    fn commit(&mut self, prepared: Prepared) {
        let Prepared {
            kind,
            handle,
            identity,
        } = prepared;
        let previous = self.attached;

        // The old store is closed before the new one goes in
        let closed = {
            let mut slot = self
                .ctx
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let closed = slot.take().map(|old| {
                let context = ErrorContext::Store {
                    kind: old.kind(),
                    path: old.path().to_path_buf(),
                };
                (context, old.close())
            });
            *slot = Some(handle);
            closed
        };
        if let Some((context, Err(e))) = closed {
            self.ctx
                .relay
                .report_error(&StoreError::from(e), ErrorCause::ClearStore, &context);
        }

        self.attached = Some(kind);
        self.attached_identity = identity;
        if let Some(identity) = identity {
            self.publish_identity(identity);
            self.pending_identity = None;
        }
        self.save_preferences();

        self.ctx.relay.set_state(PersistenceState::active(kind));
        info!("Active store is now {}", kind);
        self.ctx.relay.store_did_change(previous, kind);
    }

    fn discard(&mut self, prepared: Prepared, before: PersistenceState) {
        self.ctx.relay.log(&format!(
            "Discarding prepared {} store: a newer request is waiting",
            prepared.kind
        ));

        let context = ErrorContext::Store {
            kind: prepared.kind,
            path: prepared.handle.path().to_path_buf(),
        };
        if let Err(e) = prepared.handle.close() {
            self.ctx
                .relay
                .report_error(&StoreError::from(e), ErrorCause::ClearStore, &context);
        }
        self.ctx.relay.set_state(before);
    }

    fn fail(&mut self, failure: Failure, target: BackendKind) {
        self.ctx
            .relay
            .report_error(&failure.error, failure.cause, &failure.context);
        self.ctx.relay.set_state(PersistenceState::Failed);

        if target == BackendKind::Local {
            self.detach();
            return;
        }

        if self.attached == Some(BackendKind::Local) {
            self.ctx.relay.log("Keeping the local store attached");
            self.ctx.relay.set_state(PersistenceState::LocalActive);
            return;
        }

        match self.prepare_local() {
            Ok(prepared) => self.commit(prepared),
            Err(failure) => {
                self.ctx
                    .relay
                    .report_error(&failure.error, failure.cause, &failure.context);
                self.detach();
            }
        }
    }

    /// Close and forget the attached store
    fn detach(&mut self) {
        let old = self
            .ctx
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.attached = None;
        self.attached_identity = None;

        if let Some(old) = old {
            let context = ErrorContext::Store {
                kind: old.kind(),
                path: old.path().to_path_buf(),
            };
            if let Err(e) = old.close() {
                self.ctx
                    .relay
                    .report_error(&StoreError::from(e), ErrorCause::ClearStore, &context);
            }
        }
    }

    // ===== Helpers =====

    fn cloud_paths(&self, identity: &StoreIdentity) -> Result<(PathBuf, PathBuf), Failure> {
        let locations = &self.ctx.locations;
        match (locations.cloud_store(identity), locations.cloud_content(identity)) {
            (Some(store), Some(content)) => Ok((store, content)),
            _ => Err(Failure::new(
                StoreError::NoContainer,
                ErrorCause::OpenCloudStore,
                ErrorContext::None,
            )),
        }
    }

    fn ensure_cloud_directories(&self) -> Result<(), Failure> {
        let directories = [
            self.ctx.locations.cloud_store_directory(),
            self.ctx.locations.cloud_content_directory(),
        ];
        for dir in directories.into_iter().flatten() {
            ensure_directory(&dir)?;
        }
        Ok(())
    }

    fn open_cloud_store(
        &self,
        path: &Path,
        content: PathBuf,
    ) -> Result<Box<dyn StoreHandle>, Failure> {
        self.ctx
            .engine
            .open_store(path, BackendKind::Cloud, &self.store_options(Some(content)))
            .map_err(|e| {
                Failure::new(
                    e,
                    ErrorCause::OpenCloudStore,
                    ErrorContext::Store {
                        kind: BackendKind::Cloud,
                        path: path.to_path_buf(),
                    },
                )
            })
    }

    /// A second handle on the local store, if it exists
    fn open_local_source(&self) -> Option<Box<dyn StoreHandle>> {
        let path = self.ctx.locations.local_store();
        if !path.exists() {
            return None;
        }

        match self
            .ctx
            .engine
            .open_store(path, BackendKind::Local, &self.store_options(None))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to read local store {:?}: {}", path, e);
                None
            }
        }
    }

    fn store_options(&self, transaction_log: Option<PathBuf>) -> StoreOptions {
        StoreOptions {
            schema: self.ctx.config.schema.clone(),
            extra: self.ctx.config.extra_options.clone(),
            transaction_log,
        }
    }

    fn registered_identity(&self) -> Option<StoreIdentity> {
        match self.ctx.register.get(STORE_IDENTITY_KEY) {
            Ok(Some(value)) => match value.parse() {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!("Ignoring unreadable store identity {:?}: {}", value, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read store identity: {}", e);
                None
            }
        }
    }

    fn last_written(&self) -> Option<StoreIdentity> {
        *self.lock_last_written()
    }

    fn lock_last_written(&self) -> std::sync::MutexGuard<'_, Option<StoreIdentity>> {
        self.ctx
            .last_written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `identity` as ours, then write it to the register
    fn publish_identity(&mut self, identity: StoreIdentity) {
        *self.lock_last_written() = Some(identity);

        let value = identity.to_string();
        let current = self.ctx.register.get(STORE_IDENTITY_KEY).ok().flatten();
        if current.as_deref() == Some(value.as_str()) {
            return;
        }
        if let Err(e) = self.ctx.register.set(STORE_IDENTITY_KEY, &value) {
            warn!("Failed to publish store identity {}: {}", identity, e);
            self.ctx
                .relay
                .log(&format!("Failed to publish store identity: {}", e));
        }
    }

    fn save_preferences(&self) {
        let preferences = ManagerPreferences {
            cloud_enabled: Some(self.ctx.cloud_enabled.load(Ordering::SeqCst)),
            store_identity: self.last_written(),
        };
        let path = self.ctx.locations.preferences_file();
        if let Err(e) = preferences.save(&path) {
            warn!("{:#}", e);
        }
    }

    fn report_deletions(&self, failures: DeleteFailures) {
        for (path, error) in failures {
            self.ctx
                .relay
                .report_error(&error, ErrorCause::DeleteStore, &ErrorContext::Path(path));
        }
    }
}

fn ensure_directory(dir: &Path) -> Result<(), Failure> {
    fs::create_dir_all(dir).map_err(|source| {
        Failure::new(
            StoreError::CreateDirectory {
                path: dir.to_path_buf(),
                source,
            },
            ErrorCause::CreateStorePath,
            ErrorContext::Path(dir.to_path_buf()),
        )
    })
}

/// Collapse the run of transition requests at the head of the backlog
///
/// The last `SetCloudEnabled` wins. The latest `Repoint` survives unless a
/// later request disables the cloud, and runs after the enable.
fn coalesce(backlog: &mut VecDeque<Request>) {
    let run = backlog
        .iter()
        .take_while(|request| request.is_transition())
        .count();
    if run < 2 {
        return;
    }

    let mut enable = None;
    let mut repoint = None;
    for request in backlog.drain(..run) {
        match request {
            Request::SetCloudEnabled(enabled) => {
                if !enabled {
                    repoint = None;
                }
                enable = Some(request);
            }
            Request::Repoint(_) => repoint = Some(request),
            _ => {}
        }
    }

    let mut kept = 0;
    if let Some(request) = repoint {
        backlog.push_front(request);
        kept += 1;
    }
    if let Some(request) = enable {
        backlog.push_front(request);
        kept += 1;
    }
    debug!("Coalesced {} transition requests into {}", run, kept);
}
