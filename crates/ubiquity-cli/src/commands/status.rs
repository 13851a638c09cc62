//! Status command handlers

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use ubiquity_core::{PersistenceState, StoreManager};

use crate::output::{Output, OutputFormat};

#[derive(Debug, Serialize)]
struct StatusReport {
    state: String,
    backend: Option<String>,
    cloud_enabled: bool,
    cloud_available: bool,
    store_identity: Option<String>,
    records: Option<u64>,
    seeding: Option<String>,
}

/// Show the active store and cloud state
pub async fn show(manager: &StoreManager, output: &Output) -> Result<()> {
    let state = manager.state();
    let records = manager
        .with_store(|store| store.record_count())
        .transpose()?;
    let seeding = manager.seeding_decision().await.ok();

    let report = StatusReport {
        state: state.to_string(),
        backend: state.backend().map(|kind| kind.to_string()),
        cloud_enabled: manager.cloud_enabled(),
        cloud_available: manager.locations().cloud_available(),
        store_identity: manager.store_identity().map(|id| id.to_string()),
        records,
        seeding: seeding.map(|decision| decision.reason.to_string()),
    };

    match output.format {
        OutputFormat::Json => output.json(&report),
        OutputFormat::Quiet => {
            println!("{}", report.state);
        }
        OutputFormat::Human => {
            println!("Ubiquity Status");
            println!("===============");
            println!();
            println!("Store:");
            println!("  State:   {}", report.state);
            if state == PersistenceState::Failed {
                println!("  No store is attached. Check the log with --verbose.");
            }
            if let Some(count) = report.records {
                println!("  Records: {}", count);
            }
            println!();
            println!("Cloud:");
            println!(
                "  Status:    {}",
                if report.cloud_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if !report.cloud_available {
                println!("  Container: (not available)");
            }
            println!(
                "  Identity:  {}",
                report.store_identity.as_deref().unwrap_or("(none)")
            );
            if let Some(ref seeding) = report.seeding {
                println!("  Seeding:   {}", seeding);
            }
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct PathReport {
    local_store: PathBuf,
    local_store_directory: PathBuf,
    preferences: PathBuf,
    cloud_container: Option<PathBuf>,
    cloud_store_directory: Option<PathBuf>,
    cloud_store: Option<PathBuf>,
    cloud_content_directory: Option<PathBuf>,
    cloud_content: Option<PathBuf>,
}

/// Show every store location
pub fn paths(manager: &StoreManager, output: &Output) -> Result<()> {
    let report = PathReport {
        local_store: manager.local_store_path(),
        local_store_directory: manager.local_store_directory(),
        preferences: manager.locations().preferences_file(),
        cloud_container: manager.cloud_container_path(),
        cloud_store_directory: manager.cloud_store_directory(),
        cloud_store: manager.cloud_store_path(),
        cloud_content_directory: manager.cloud_content_directory(),
        cloud_content: manager.cloud_content_path(),
    };

    match output.format {
        OutputFormat::Json => output.json(&report),
        OutputFormat::Quiet => {
            println!("{}", report.local_store.display());
        }
        OutputFormat::Human => {
            println!("Local:");
            println!("  Store:       {}", report.local_store.display());
            println!("  Directory:   {}", report.local_store_directory.display());
            println!("  Preferences: {}", report.preferences.display());
            println!();
            println!("Cloud:");
            println!("  Container:   {}", display(&report.cloud_container));
            println!("  Stores:      {}", display(&report.cloud_store_directory));
            println!("  Store:       {}", display(&report.cloud_store));
            println!("  Logs:        {}", display(&report.cloud_content_directory));
            println!("  Store logs:  {}", display(&report.cloud_content));
        }
    }

    Ok(())
}

fn display(path: &Option<PathBuf>) -> String {
    path.as_deref()
        .map(Path::display)
        .map(|path| path.to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}
