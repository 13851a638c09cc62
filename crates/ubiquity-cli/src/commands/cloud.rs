//! Cloud and store lifecycle command handlers

use anyhow::{bail, Result};

use ubiquity_core::{PersistenceState, StoreManager};

use crate::commands::confirm;
use crate::output::{Output, OutputFormat};

/// Turn the cloud store on or off and wait for the switch
pub async fn set_enabled(manager: &StoreManager, enabled: bool, output: &Output) -> Result<()> {
    manager.set_cloud_enabled(enabled);
    manager.settle().await;

    let state = manager.state();
    match (enabled, state) {
        (true, PersistenceState::CloudActive) => output.success("Cloud store is active"),
        (false, PersistenceState::LocalActive) => output.success("Local store is active"),
        (true, _) if !manager.locations().cloud_available() => {
            output.warning("Cloud enabled, but no cloud container is available");
        }
        _ => output.warning(&format!("Store state is {}", state)),
    }
    Ok(())
}

/// Report whether enabling the cloud would seed it from the local store
pub async fn seed_check(manager: &StoreManager, output: &Output) -> Result<()> {
    let decision = manager.seeding_decision().await?;

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({
            "safe": decision.is_safe(),
            "reason": decision.reason,
        })),
        OutputFormat::Quiet => println!("{}", decision.is_safe()),
        OutputFormat::Human => {
            if decision.is_safe() {
                println!("Safe to seed: the local store will be copied to the cloud.");
            } else {
                println!("Not seeding: {}", decision.reason);
            }
        }
    }
    Ok(())
}

/// Wipe the cloud container
pub async fn nuke(manager: &StoreManager, yes: bool, output: &Output) -> Result<()> {
    if !confirm(
        "Delete every cloud store and log for all devices?",
        yes,
        output,
    )? {
        bail!("Aborted. Pass --yes to wipe the cloud container.");
    }

    manager.nuke_cloud_container();
    manager.settle().await;

    output.success("Cloud container wiped");
    if let Some(identity) = manager.store_identity() {
        output.message(&format!("New cloud store: {}", identity));
    }
    Ok(())
}

pub async fn delete_local(manager: &StoreManager, yes: bool, output: &Output) -> Result<()> {
    let path = manager.local_store_path();
    if !confirm(
        &format!("Delete local store {}?", path.display()),
        yes,
        output,
    )? {
        bail!("Aborted. Pass --yes to delete the local store.");
    }

    manager.delete_local_store();
    manager.settle().await;

    output.success(&format!("Deleted {}", path.display()));
    Ok(())
}

pub async fn delete_cloud(manager: &StoreManager, yes: bool, output: &Output) -> Result<()> {
    let Some(path) = manager.cloud_store_path() else {
        bail!("No cloud store to delete");
    };
    if !confirm(
        &format!("Delete cloud store {}?", path.display()),
        yes,
        output,
    )? {
        bail!("Aborted. Pass --yes to delete the cloud store.");
    }

    manager.delete_cloud_store();
    manager.settle().await;

    output.success(&format!("Deleted {}", path.display()));
    Ok(())
}
