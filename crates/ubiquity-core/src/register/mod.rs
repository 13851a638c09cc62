//! Identity register
//!
//! A small key-value store shared by every device using the synchronized
//! container. The coordinator keeps exactly one key in it,
//! [`STORE_IDENTITY_KEY`], naming the generation of the cloud store that is
//! currently authoritative.

mod file;
mod memory;

use tokio::sync::broadcast;

use crate::error::StoreResult;

pub use file::FileRegister;
pub use memory::MemoryRegister;

/// Register key holding the authoritative store identity
pub const STORE_IDENTITY_KEY: &str = "UbiquityStoreIdentity";

/// Capacity of a register's change channel
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// Key-value register shared between devices
pub trait IdentityRegister: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    fn remove(&self, key: &str) -> StoreResult<()>;

    /// Names of keys whose value changed, by anyone
    fn subscribe(&self) -> broadcast::Receiver<String>;

    /// Pull changes made elsewhere; returns whether anything changed
    fn synchronize(&self) -> StoreResult<bool>;
}
