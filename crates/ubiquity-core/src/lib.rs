//! Ubiquity Core Library
//!
//! Keeps an application's data in one of two stores, a local-only store or
//! a cloud-synchronized one, and switches between them on request. Turning
//! the cloud on seeds the cloud store from the local store when that is
//! safe; a store identity shared through a register lets every device
//! follow when one of them wipes the cloud container and starts over.
//!
//! # Architecture
//!
//! - **StoreManager**: facade owned by the application
//! - **Switch worker**: one thread running every state change in order
//! - **Identity watcher**: async task reacting to foreign identity changes
//!
//! # Quick Start
//!
//! ```text
//! let manager = StoreManager::open_default()?;
//! manager.set_delegate(&my_delegate);
//!
//! manager.set_cloud_enabled(true);
//! manager.settle().await;
//!
//! let count = manager.with_store(|store| store.record_count());
//! ```
//!
//! # Modules
//!
//! - `manager`: Public facade (main entry point)
//! - `config`: Settings and per-store configuration
//! - `locations`: Where local and cloud stores live
//! - `engine`: Persistence engine interface and the SQLite engine
//! - `register`: Shared key-value register holding the store identity
//! - `seeding`: Whether the local store may seed the cloud
//! - `migration`: Copying the local store into a new cloud store
//! - `relay`: Events, observers and the import delegate
//! - `preferences`: Persisted per-store preferences

pub mod config;
pub mod engine;
pub mod error;
pub mod locations;
pub mod manager;
pub mod migration;
pub mod models;
pub mod preferences;
pub mod register;
pub mod relay;
pub mod seeding;

mod controller;
mod lifecycle;
mod watcher;

#[cfg(test)]
mod testing;

pub use config::{ResolvedConfig, SchemaReference, Settings, StoreConfiguration};
pub use engine::{DataContext, EngineError, PersistenceEngine, SqliteEngine, StoreHandle};
pub use error::{ErrorCause, ErrorContext, StoreError, StoreResult};
pub use locations::{ContainerLookup, DirectoryContainers, StoreLocations};
pub use manager::{ExternalServices, StoreManager};
pub use models::{BackendKind, ImportedChanges, PersistenceState, Record, RecordChange, StoreIdentity};
pub use preferences::ManagerPreferences;
pub use register::{FileRegister, IdentityRegister, MemoryRegister, STORE_IDENTITY_KEY};
pub use relay::{ObserverId, StoreEvent, StoreManagerDelegate};
pub use seeding::{SeedingDecision, SeedingReason};
