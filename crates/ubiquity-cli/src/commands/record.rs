//! Record command handlers

use anyhow::{anyhow, Context, Result};
use uuid::Uuid;

use ubiquity_core::{Record, RecordChange, StoreManager};

use crate::output::Output;

/// Add a record to the active store
pub fn add(manager: &StoreManager, entity: String, payload: String, output: &Output) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&payload).context("Payload must be valid JSON")?;
    let record = Record::new(entity, payload);

    manager
        .with_store(|store| store.apply(&[RecordChange::Upsert(record.clone())]))
        .ok_or_else(no_store)?
        .context("Failed to add record")?;

    output.success(&format!("Added record: {}", record.id));
    output.print_record(&record);
    Ok(())
}

/// List records, optionally of one entity
pub fn list(manager: &StoreManager, entity: Option<String>, output: &Output) -> Result<()> {
    let mut records = manager
        .with_store(|store| store.records())
        .ok_or_else(no_store)??;

    if let Some(ref entity) = entity {
        records.retain(|record| &record.entity == entity);
    }

    output.print_records(&records);
    Ok(())
}

pub fn show(manager: &StoreManager, id: String, output: &Output) -> Result<()> {
    let uuid = Uuid::parse_str(&id).with_context(|| format!("Invalid record ID: {}", id))?;

    let record = manager
        .with_store(|store| store.get(uuid))
        .ok_or_else(no_store)??
        .ok_or_else(|| anyhow!("Record not found: {}", id))?;

    output.print_record(&record);
    Ok(())
}

fn no_store() -> anyhow::Error {
    anyhow!("No store is attached. Run `ubiquity status` for details.")
}
