//! Coordinator preferences
//!
//! Remembers, next to the local store, whether the cloud was enabled and
//! which store identity this device last wrote to the register. Uses atomic
//! writes (write to temp file, then rename) to prevent corruption.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::StoreIdentity;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerPreferences {
    /// Last requested cloud preference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_enabled: Option<bool>,

    /// Identity this device last wrote to the register
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_identity: Option<StoreIdentity>,
}

impl ManagerPreferences {
    /// Load preferences; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read preferences from {:?}", path))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse preferences from {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize preferences")?;
        atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to save preferences to {:?}", path))
    }
}

/// Write a file atomically
///
/// Writes to a temporary file in the same directory, syncs it, then renames
/// it over the target so readers never see a partial file.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write to temp file {:?}", temp_path))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp file {:?}", temp_path))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}
