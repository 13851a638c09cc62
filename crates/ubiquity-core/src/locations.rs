//! Store locations
//!
//! Every file the coordinator touches is derived here from the resolved
//! configuration and the container root. Nothing in this module has state
//! beyond its inputs, so the same inputs always give the same paths.
//!
//! Layout of a cloud container:
//!
//! ```text
//! <container>/
//!   CloudStore.nosync/<content>-<identity>.sqlite   store databases
//!   CloudLogs/<content>-<identity>/                 transaction logs
//! ```

use std::path::{Path, PathBuf};

use crate::config::{ResolvedConfig, STORE_EXTENSION};
use crate::models::StoreIdentity;

/// Directory (inside the container) holding cloud store databases
pub const CLOUD_STORE_DIRECTORY: &str = "CloudStore.nosync";

/// Directory (inside the container) holding transaction logs
pub const CLOUD_CONTENT_DIRECTORY: &str = "CloudLogs";

/// Maps a container identity to the directory the container is mounted at
pub trait ContainerLookup: Send + Sync {
    fn container_root(&self, container_identity: &str) -> Option<PathBuf>;
}

/// Containers mounted side by side under one directory
///
/// `iCloud.com.example.notes` lives at `<base>/iCloud~com~example~notes`.
#[derive(Debug, Clone)]
pub struct DirectoryContainers {
    base: Option<PathBuf>,
}

impl DirectoryContainers {
    pub fn new(base: Option<PathBuf>) -> Self {
        Self { base }
    }
}

impl ContainerLookup for DirectoryContainers {
    fn container_root(&self, container_identity: &str) -> Option<PathBuf> {
        let base = self.base.as_ref()?;
        if container_identity.is_empty() {
            return None;
        }
        Some(base.join(container_identity.replace('.', "~")))
    }
}

/// Every location of one managed store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocations {
    content_name: String,
    local_store: PathBuf,
    cloud_container: Option<PathBuf>,
}

impl StoreLocations {
    pub fn new(config: &ResolvedConfig, containers: &dyn ContainerLookup) -> Self {
        let cloud_container = config
            .container_identity
            .as_deref()
            .and_then(|identity| containers.container_root(identity));

        Self {
            content_name: config.content_name.clone(),
            local_store: config.local_store_location.clone(),
            cloud_container,
        }
    }

    /// Whether a cloud container could be resolved
    pub fn cloud_available(&self) -> bool {
        self.cloud_container.is_some()
    }

    pub fn local_store_directory(&self) -> PathBuf {
        self.local_store
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn local_store(&self) -> &Path {
        &self.local_store
    }

    /// Where the coordinator keeps its own preferences
    pub fn preferences_file(&self) -> PathBuf {
        self.local_store_directory()
            .join(format!("{}.preferences.toml", self.content_name))
    }

    pub fn cloud_container(&self) -> Option<&Path> {
        self.cloud_container.as_deref()
    }

    pub fn cloud_store_directory(&self) -> Option<PathBuf> {
        self.cloud_container
            .as_ref()
            .map(|root| root.join(CLOUD_STORE_DIRECTORY))
    }

    /// Database of the given generation of the cloud store
    pub fn cloud_store(&self, identity: &StoreIdentity) -> Option<PathBuf> {
        self.cloud_store_directory().map(|dir| {
            dir.join(format!(
                "{}.{}",
                self.generation_name(identity),
                STORE_EXTENSION
            ))
        })
    }

    pub fn cloud_content_directory(&self) -> Option<PathBuf> {
        self.cloud_container
            .as_ref()
            .map(|root| root.join(CLOUD_CONTENT_DIRECTORY))
    }

    /// Transaction logs of the given generation of the cloud store
    pub fn cloud_content(&self, identity: &StoreIdentity) -> Option<PathBuf> {
        self.cloud_content_directory()
            .map(|dir| dir.join(self.generation_name(identity)))
    }

    fn generation_name(&self, identity: &StoreIdentity) -> String {
        format!("{}-{}", self.content_name, identity)
    }
}
