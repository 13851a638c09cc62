//! Data models shared across the coordinator
//!
//! Backend kinds and coordinator states, the identity token of the
//! synchronized dataset, and the minimal record model spoken at the
//! persistence engine boundary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which of the two interchangeable backends a store is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Cloud => write!(f, "cloud"),
        }
    }
}

/// Coordinator state
///
/// Exactly one state holds at a time. In `LocalActive`/`CloudActive` the
/// matching backend is attached; in `Uninitialized` and `Failed` nothing is.
/// The switching states keep the previous backend attached until the new
/// one is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceState {
    Uninitialized,
    LocalActive,
    CloudActive,
    SwitchingToCloud,
    SwitchingToLocal,
    Failed,
}

impl PersistenceState {
    /// The stable state for an attached backend
    pub fn active(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Local => PersistenceState::LocalActive,
            BackendKind::Cloud => PersistenceState::CloudActive,
        }
    }

    /// Backend attached while in this state, if it is a stable one
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            PersistenceState::LocalActive => Some(BackendKind::Local),
            PersistenceState::CloudActive => Some(BackendKind::Cloud),
            _ => None,
        }
    }

    pub fn is_switching(&self) -> bool {
        matches!(
            self,
            PersistenceState::SwitchingToCloud | PersistenceState::SwitchingToLocal
        )
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PersistenceState::Uninitialized => "uninitialized",
            PersistenceState::LocalActive => "local active",
            PersistenceState::CloudActive => "cloud active",
            PersistenceState::SwitchingToCloud => "switching to cloud",
            PersistenceState::SwitchingToLocal => "switching to local",
            PersistenceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Generation token of the synchronized dataset
///
/// Opaque; only ever compared for equality. A new identity is minted when
/// a device seeds or resets the cloud store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreIdentity(Uuid);

impl StoreIdentity {
    /// Mint a new identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StoreIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for StoreIdentity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A single persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    /// Entity (table/model) name
    pub entity: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(entity: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity: entity.into(),
            payload,
            updated_at: Utc::now(),
        }
    }
}

/// A change applied to a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RecordChange {
    Upsert(Record),
    Delete { id: Uuid },
}

impl RecordChange {
    pub fn record_id(&self) -> Uuid {
        match self {
            RecordChange::Upsert(record) => record.id,
            RecordChange::Delete { id } => *id,
        }
    }
}

/// Changes the engine imported from another device's transaction log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedChanges {
    /// Device the changes came from
    pub origin: String,
    pub changes: Vec<RecordChange>,
}

impl ImportedChanges {
    pub fn new(origin: impl Into<String>, changes: Vec<RecordChange>) -> Self {
        Self {
            origin: origin.into(),
            changes,
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
