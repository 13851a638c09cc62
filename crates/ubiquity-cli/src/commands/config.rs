//! Config command handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use ubiquity_core::Settings;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, cloud_root, container_identity, content_name, schemas, \
                          cloud_enabled, identity_debounce_ms, register_poll_ms";

fn load(config_path: Option<&PathBuf>) -> Result<Settings> {
    match config_path {
        Some(path) => Settings::load_from_path(path),
        None => Settings::load(),
    }
    .context("Failed to load configuration")
}

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let settings = load(config_path)?;

    match output.format {
        OutputFormat::Json => output.json(&settings),
        OutputFormat::Quiet => {
            println!("{}", settings.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Settings::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", settings.data_dir.display());
            println!("  cloud_root:           {}", or_unset(settings.cloud_root.as_deref()));
            println!(
                "  container_identity:   {}",
                settings.container_identity.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  content_name:         {}",
                settings.content_name.as_deref().unwrap_or("(not set)")
            );
            println!("  schemas:              {}", settings.schemas.join(", "));
            println!("  cloud_enabled:        {}", settings.cloud_enabled);
            println!("  identity_debounce_ms: {}", settings.identity_debounce_ms);
            println!("  register_poll_ms:     {}", settings.register_poll_ms);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut settings = load(config_path)?;
    apply(&mut settings, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Settings::config_file_path);
    settings
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    let optional = |value: &str| {
        if value.is_empty() || value == "none" {
            None
        } else {
            Some(value.to_string())
        }
    };

    match key {
        "data_dir" => settings.data_dir = value.into(),
        "cloud_root" => settings.cloud_root = optional(value).map(PathBuf::from),
        "container_identity" => settings.container_identity = optional(value),
        "content_name" => settings.content_name = optional(value),
        "schemas" => {
            settings.schemas = value
                .split(',')
                .map(str::trim)
                .filter(|model| !model.is_empty())
                .map(str::to_string)
                .collect();
        }
        "cloud_enabled" => {
            settings.cloud_enabled = value
                .parse()
                .context("Invalid value for cloud_enabled. Use 'true' or 'false'.")?;
        }
        "identity_debounce_ms" => {
            settings.identity_debounce_ms = value
                .parse()
                .context("Invalid value for identity_debounce_ms. Use milliseconds.")?;
        }
        "register_poll_ms" => {
            settings.register_poll_ms = value
                .parse()
                .context("Invalid value for register_poll_ms. Use milliseconds (0 = off).")?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

fn or_unset(path: Option<&Path>) -> String {
    path.map(|path| path.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}
