//! Notification relay
//!
//! Everything the coordinator tells the application goes through here:
//! the [`StoreEvent`] bus, the state stream, the import delegate and the
//! optional observers.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{broadcast, watch};
use tracing::{debug, error};

use crate::engine::{DataContext, PersistenceEngine};
use crate::error::{ErrorCause, ErrorContext, StoreError};
use crate::models::{BackendKind, ImportedChanges, PersistenceState};

/// Capacity of the event and state buses
const BUS_CAPACITY: usize = 64;

/// Events published to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A backend was committed as the active store
    StoreDidChange {
        previous: Option<BackendKind>,
        current: BackendKind,
    },
    /// Changes from another device were merged and saved
    StoreDidImportChanges { origin: String, count: usize },
}

/// Required capability of the application
pub trait StoreManagerDelegate: Send + Sync {
    /// Context that imported cloud changes are merged into
    fn context_for_imports(&self) -> Arc<Mutex<dyn DataContext>>;
}

/// Handle for removing an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type SwitchObserver = Arc<dyn Fn(bool) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&StoreError, ErrorCause, &ErrorContext) + Send + Sync>;
type LogObserver = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    switched: Vec<(ObserverId, SwitchObserver)>,
    errors: Vec<(ObserverId, ErrorObserver)>,
    logs: Vec<(ObserverId, LogObserver)>,
}

impl Observers {
    fn next_id(&mut self) -> ObserverId {
        self.next_id += 1;
        ObserverId(self.next_id)
    }
}

struct Inner {
    events: broadcast::Sender<StoreEvent>,
    states: broadcast::Sender<PersistenceState>,
    state: watch::Sender<PersistenceState>,
    delegate: Mutex<Option<Weak<dyn StoreManagerDelegate>>>,
    observers: Mutex<Observers>,
}

/// Cheap to clone; clones share the same buses and registrations
#[derive(Clone)]
pub struct NotificationRelay {
    inner: Arc<Inner>,
}

impl NotificationRelay {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BUS_CAPACITY);
        let (states, _) = broadcast::channel(BUS_CAPACITY);
        let (state, _) = watch::channel(PersistenceState::Uninitialized);

        Self {
            inner: Arc::new(Inner {
                events,
                states,
                state,
                delegate: Mutex::new(None),
                observers: Mutex::new(Observers::default()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<PersistenceState> {
        self.inner.states.subscribe()
    }

    pub fn state(&self) -> PersistenceState {
        *self.inner.state.borrow()
    }

    /// Enter a new coordinator state
    pub(crate) fn set_state(&self, state: PersistenceState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("Store state: {} -> {}", previous, state);
            let _ = self.inner.states.send(state);
        }
    }

    // ===== Delegate =====

    /// Hold `delegate` weakly
    pub fn set_delegate<D>(&self, delegate: &Arc<D>)
    where
        D: StoreManagerDelegate + 'static,
    {
        let weak: Weak<D> = Arc::downgrade(delegate);
        let weak: Weak<dyn StoreManagerDelegate> = weak;
        *self.delegate_slot() = Some(weak);
    }

    pub fn clear_delegate(&self) {
        *self.delegate_slot() = None;
    }

    fn delegate(&self) -> Option<Arc<dyn StoreManagerDelegate>> {
        self.delegate_slot().as_ref().and_then(Weak::upgrade)
    }

    fn delegate_slot(&self) -> std::sync::MutexGuard<'_, Option<Weak<dyn StoreManagerDelegate>>> {
        self.inner
            .delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Observers =====

    /// Called with `true` when the cloud store became active, `false` for local
    pub fn on_backend_switched<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut observers = self.observers();
        let id = observers.next_id();
        observers.switched.push((id, Arc::new(observer)));
        id
    }

    pub fn on_error<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&StoreError, ErrorCause, &ErrorContext) + Send + Sync + 'static,
    {
        let mut observers = self.observers();
        let id = observers.next_id();
        observers.errors.push((id, Arc::new(observer)));
        id
    }

    pub fn on_log<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut observers = self.observers();
        let id = observers.next_id();
        observers.logs.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers();
        let before = observers.switched.len() + observers.errors.len() + observers.logs.len();
        observers.switched.retain(|(observer, _)| *observer != id);
        observers.errors.retain(|(observer, _)| *observer != id);
        observers.logs.retain(|(observer, _)| *observer != id);
        before != observers.switched.len() + observers.errors.len() + observers.logs.len()
    }

    fn observers(&self) -> std::sync::MutexGuard<'_, Observers> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Publishing =====

    /// Announce a committed backend swap
    pub(crate) fn store_did_change(&self, previous: Option<BackendKind>, current: BackendKind) {
        let _ = self
            .inner
            .events
            .send(StoreEvent::StoreDidChange { previous, current });

        // Observers run outside the lock so they may register others
        let switched: Vec<SwitchObserver> = self
            .observers()
            .switched
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in switched {
            observer(current == BackendKind::Cloud);
        }
    }

    /// Merge imported changes into the delegate's context
    ///
    /// `StoreDidImportChanges` is only published once the context saved.
    /// Returns whether the changes were merged.
    pub(crate) fn import_changes(
        &self,
        engine: &dyn PersistenceEngine,
        changes: &ImportedChanges,
    ) -> bool {
        let Some(delegate) = self.delegate() else {
            self.log(&format!(
                "Dropping {} imported changes from {}: no delegate",
                changes.len(),
                changes.origin
            ));
            return false;
        };

        let context = delegate.context_for_imports();
        let result = {
            let mut context = context.lock().unwrap_or_else(PoisonError::into_inner);
            engine
                .merge_changes(changes, &mut *context)
                .map_err(StoreError::from)
                .and_then(|()| {
                    context
                        .save()
                        .map_err(|e| StoreError::Context(format!("{:#}", e)))
                })
        };

        match result {
            Ok(()) => {
                self.log(&format!(
                    "Imported {} changes from {}",
                    changes.len(),
                    changes.origin
                ));
                let _ = self.inner.events.send(StoreEvent::StoreDidImportChanges {
                    origin: changes.origin.clone(),
                    count: changes.len(),
                });
                true
            }
            Err(e) => {
                self.report_error(
                    &e,
                    ErrorCause::ImportChanges,
                    &ErrorContext::Changes {
                        origin: changes.origin.clone(),
                        count: changes.len(),
                    },
                );
                false
            }
        }
    }

    pub(crate) fn report_error(&self, err: &StoreError, cause: ErrorCause, context: &ErrorContext) {
        error!("Failed to {}: {} ({:?})", cause, err, context);

        let errors: Vec<ErrorObserver> = self
            .observers()
            .errors
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in errors {
            observer(err, cause, context);
        }
    }

    /// Diagnostic line for the application's log observers
    pub(crate) fn log(&self, message: &str) {
        debug!("{}", message);

        let logs: Vec<LogObserver> = self
            .observers()
            .logs
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in logs {
            observer(message);
        }
    }
}

impl Default for NotificationRelay {
    fn default() -> Self {
        Self::new()
    }
}
