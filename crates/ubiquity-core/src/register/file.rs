//! Register backed by a JSON file
//!
//! Writes go straight to disk. A file watcher on the register's directory
//! picks up writes made by other processes; registers opened with
//! [`FileRegister::open_polled`] only see them after
//! [`IdentityRegister::synchronize`] re-reads the file.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{IdentityRegister, CHANGE_CHANNEL_CAPACITY};
use crate::error::{StoreError, StoreResult};
use crate::preferences::atomic_write;

pub struct FileRegister {
    shared: Arc<Shared>,
    watcher: Option<Mutex<RecommendedWatcher>>,
}

struct Shared {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
    changes: broadcast::Sender<String>,
}

impl FileRegister {
    /// Open the register at `path` and watch it for other writers
    ///
    /// A missing file is an empty register. When the directory cannot be
    /// watched the register still works and falls back to polling.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let mut register = Self::open_polled(path)?;

        let path = register.shared.path.clone();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        match watch(&register.shared) {
            Ok(watcher) => register.watcher = Some(Mutex::new(watcher)),
            Err(e) => warn!(
                "Not watching register {:?}, changes from other processes need polling: {}",
                path, e
            ),
        }
        Ok(register)
    }

    /// Open the register at `path` without a file watcher
    pub fn open_polled(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let values = read_values(&path)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                path,
                values: Mutex::new(values),
                changes,
            }),
            watcher: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_watched(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Shared {
    fn update(&self, key: &str, value: Option<&str>) -> StoreResult<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);

        // Start from the file so writes made elsewhere are not clobbered
        let mut next = read_values(&self.path)?;
        match value {
            Some(value) => next.insert(key.to_string(), value.to_string()),
            None => next.remove(key),
        };

        let data = serde_json::to_vec_pretty(&next)
            .map_err(|e| StoreError::Register(format!("Failed to encode register: {}", e)))?;
        atomic_write(&self.path, &data).map_err(|e| StoreError::Register(format!("{:#}", e)))?;

        let changed = changed_keys(&values, &next);
        *values = next;
        drop(values);

        self.announce(changed);
        Ok(())
    }

    fn synchronize(&self) -> StoreResult<bool> {
        // Read under the lock so a stale read cannot undo a newer local write
        let changed = {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            let next = read_values(&self.path)?;
            let changed = changed_keys(&values, &next);
            *values = next;
            changed
        };

        if !changed.is_empty() {
            debug!("Register {:?} changed: {:?}", self.path, changed);
        }
        Ok(self.announce(changed))
    }

    fn announce(&self, changed: Vec<String>) -> bool {
        let any = !changed.is_empty();
        for key in changed {
            let _ = self.changes.send(key);
        }
        any
    }
}

impl IdentityRegister for FileRegister {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let values = self
            .shared
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.shared.update(key, Some(value))
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.shared.update(key, None)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.shared.changes.subscribe()
    }

    fn synchronize(&self) -> StoreResult<bool> {
        self.shared.synchronize()
    }
}

/// Watch the register's directory; writers replace the file by renaming
fn watch(shared: &Arc<Shared>) -> notify::Result<RecommendedWatcher> {
    let dir = match shared.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    };
    let name: Option<OsString> = shared.path.file_name().map(OsString::from);
    let weak: Weak<Shared> = Arc::downgrade(shared);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            let touches_register = event
                .paths
                .iter()
                .any(|path| path.file_name().map(OsString::from) == name);
            if !touches_register {
                return;
            }
            if let Some(shared) = weak.upgrade() {
                if let Err(e) = shared.synchronize() {
                    warn!("Failed to re-read register {:?}: {}", shared.path, e);
                }
            }
        }
        Err(e) => warn!("Register watch error: {}", e),
    })?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn read_values(path: &Path) -> StoreResult<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = fs::read(path).map_err(|e| StoreError::from_io(e, path.to_path_buf()))?;
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    serde_json::from_slice(&content)
        .map_err(|e| StoreError::Register(format!("Failed to parse {:?}: {}", path, e)))
}

/// Keys added, removed or modified between two snapshots
fn changed_keys(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut keys: Vec<String> = after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    keys.extend(
        before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .cloned(),
    );
    keys
}
