//! Cloud identity watcher
//!
//! Listens for changes of [`STORE_IDENTITY_KEY`] in the register. A burst
//! of changes is collapsed by a trailing debounce; once the register has
//! been quiet for the debounce period the current value is compared with
//! the identity this device last wrote, and a foreign value is handed to
//! the switch controller as a re-point request.

use std::future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::controller::{LastWritten, Request};
use crate::models::StoreIdentity;
use crate::register::{IdentityRegister, STORE_IDENTITY_KEY};

pub(crate) struct CloudIdentityWatcher {
    register: Arc<dyn IdentityRegister>,
    requests: mpsc::UnboundedSender<Request>,
    last_written: LastWritten,
    debounce: Duration,
    poll_interval: Option<Duration>,
}

impl CloudIdentityWatcher {
    pub(crate) fn new(
        register: Arc<dyn IdentityRegister>,
        requests: mpsc::UnboundedSender<Request>,
        last_written: LastWritten,
        debounce: Duration,
        poll_interval: Option<Duration>,
    ) -> Self {
        Self {
            register,
            requests,
            last_written,
            debounce,
            poll_interval,
        }
    }

    /// Start watching on `runtime`
    ///
    /// The register subscription is taken before this returns, so no change
    /// made afterwards is missed.
    pub(crate) fn spawn(self, runtime: &Handle) -> JoinHandle<()> {
        let changes = self.register.subscribe();
        runtime.spawn(self.run(changes))
    }

    async fn run(self, mut changes: broadcast::Receiver<String>) {
        let mut poll = self.poll_interval.map(|period| {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                received = changes.recv() => match received {
                    Ok(key) if key == STORE_IDENTITY_KEY => {
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Identity watcher missed {} register changes", skipped);
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    if !self.check_identity() {
                        break;
                    }
                }
                _ = tick(&mut poll) => {
                    if let Err(e) = self.register.synchronize() {
                        warn!("Failed to synchronize identity register: {}", e);
                    }
                }
            }
        }

        debug!("Identity watcher stopped");
    }

    /// Act on the settled register value; false once the controller is gone
    fn check_identity(&self) -> bool {
        let value = match self.register.get(STORE_IDENTITY_KEY) {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("Store identity removed from register; ignoring");
                return true;
            }
            Err(e) => {
                warn!("Failed to read store identity: {}", e);
                return true;
            }
        };

        let identity: StoreIdentity = match value.parse() {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Ignoring unreadable store identity {:?}: {}", value, e);
                return true;
            }
        };

        let last_written = *self
            .last_written
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last_written == Some(identity) {
            return true;
        }

        info!("Cloud store identity changed to {}", identity);
        self.requests.send(Request::Repoint(identity)).is_ok()
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}
