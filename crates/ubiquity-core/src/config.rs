//! Configuration and store configuration resolution
//!
//! Settings are loaded from:
//! 1. Default values
//! 2. Config file (~/.config/ubiquity/config.toml)
//! 3. Environment variables (UBIQUITY_* prefix)
//!
//! Environment variables take precedence over config file values.
//!
//! The application then describes the store it wants with a
//! [`StoreConfiguration`] (every field optional) and [`ConfigResolver`]
//! fills in whatever was left out, producing the immutable
//! [`ResolvedConfig`] a `StoreManager` is built from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "UBIQUITY";

/// Store name used when the application does not name its store
pub const DEFAULT_CONTENT_NAME: &str = "UbiquityStore";

/// Extension of store database files
pub const STORE_EXTENSION: &str = "sqlite";

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the local store (and preferences)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory under which synchronized containers are mounted
    #[serde(default = "default_cloud_root")]
    pub cloud_root: Option<PathBuf>,

    /// Primary container identity (e.g. `iCloud.com.example.notes`)
    #[serde(default)]
    pub container_identity: Option<String>,

    /// Store name
    #[serde(default)]
    pub content_name: Option<String>,

    /// Schema models available to the application
    #[serde(default)]
    pub schemas: Vec<String>,

    /// Whether the cloud store is preferred on first launch
    #[serde(default)]
    pub cloud_enabled: bool,

    /// Quiet period before a foreign identity change is acted upon
    #[serde(default = "default_identity_debounce_ms")]
    pub identity_debounce_ms: u64,

    /// Interval for re-reading the register when file watching is unavailable (0 = off)
    #[serde(default)]
    pub register_poll_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cloud_root: default_cloud_root(),
            container_identity: None,
            content_name: None,
            schemas: Vec::new(),
            cloud_enabled: false,
            identity_debounce_ms: default_identity_debounce_ms(),
            register_poll_ms: 0,
        }
    }
}

impl Settings {
    /// Load settings from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (UBIQUITY_DATA_DIR, UBIQUITY_CONTAINER, ...)
    /// 2. Config file (~/.config/ubiquity/config.toml or UBIQUITY_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load settings from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load settings from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut settings: Settings =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_CLOUD_ROOT", ENV_PREFIX)) {
            self.cloud_root = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        // Empty string clears the container
        if let Ok(val) = std::env::var(format!("{}_CONTAINER", ENV_PREFIX)) {
            self.container_identity = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_CONTENT_NAME", ENV_PREFIX)) {
            self.content_name = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_CLOUD_ENABLED", ENV_PREFIX)) {
            self.cloud_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Save settings to the config file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save settings to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with UBIQUITY_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ubiquity")
            .join("config.toml")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ubiquity")
}

fn default_cloud_root() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("ubiquity").join("containers"))
}

fn default_identity_debounce_ms() -> u64 {
    250
}

/// The set of data models a store is opened with
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaReference {
    models: Vec<String>,
}

impl SchemaReference {
    /// A schema made of a single named model
    pub fn named(model: impl Into<String>) -> Self {
        Self {
            models: vec![model.into()],
        }
    }

    /// Merge several models into one schema
    pub fn merged<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut models: Vec<String> = models.into_iter().map(Into::into).collect();
        models.sort();
        models.dedup();
        Self { models }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Stable string the engine records alongside the data
    pub fn fingerprint(&self) -> String {
        self.models.join("+")
    }
}

/// Store overrides supplied by the application
///
/// Every field is optional; missing fields resolve to defaults.
#[derive(Debug, Clone, Default)]
pub struct StoreConfiguration {
    pub content_name: Option<String>,
    pub schema: Option<SchemaReference>,
    pub local_store_location: Option<PathBuf>,
    pub container_identity: Option<String>,
    pub extra_options: BTreeMap<String, String>,
}

impl StoreConfiguration {
    pub fn named(content_name: impl Into<String>) -> Self {
        Self {
            content_name: Some(content_name.into()),
            ..Self::default()
        }
    }

    pub fn with_schema(mut self, schema: SchemaReference) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_local_store(mut self, location: impl Into<PathBuf>) -> Self {
        self.local_store_location = Some(location.into());
        self
    }

    pub fn with_container(mut self, identity: impl Into<String>) -> Self {
        self.container_identity = Some(identity.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_options.insert(key.into(), value.into());
        self
    }
}

/// Fully resolved, immutable store configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub content_name: String,
    pub schema: SchemaReference,
    pub local_store_location: PathBuf,
    pub container_identity: Option<String>,
    pub extra_options: BTreeMap<String, String>,
    /// Cloud preference used when no preference has been persisted yet
    pub initial_cloud_enabled: bool,
    pub identity_debounce: Duration,
    pub register_poll_interval: Option<Duration>,
}

/// Resolves [`StoreConfiguration`] overrides against [`Settings`]
pub struct ConfigResolver<'a> {
    settings: &'a Settings,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Resolve with every field defaulted
    pub fn resolve_defaults(&self) -> Result<ResolvedConfig> {
        self.resolve(StoreConfiguration::default())
    }

    /// Fill the gaps in `overrides`
    ///
    /// Overrides win over settings, settings win over built-in defaults.
    pub fn resolve(&self, overrides: StoreConfiguration) -> Result<ResolvedConfig> {
        let content_name = overrides
            .content_name
            .or_else(|| self.settings.content_name.clone())
            .unwrap_or_else(|| DEFAULT_CONTENT_NAME.to_string());
        validate_content_name(&content_name)?;

        let schema = overrides
            .schema
            .unwrap_or_else(|| SchemaReference::merged(self.settings.schemas.iter().cloned()));

        let local_store_location = overrides.local_store_location.unwrap_or_else(|| {
            self.settings
                .data_dir
                .join(format!("{}.{}", content_name, STORE_EXTENSION))
        });
        if local_store_location.file_name().is_none() {
            bail!(
                "Local store location must name a file: {:?}",
                local_store_location
            );
        }

        let container_identity = overrides
            .container_identity
            .or_else(|| self.settings.container_identity.clone())
            .filter(|identity| !identity.is_empty());

        let register_poll_interval = match self.settings.register_poll_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(ResolvedConfig {
            content_name,
            schema,
            local_store_location,
            container_identity,
            extra_options: overrides.extra_options,
            initial_cloud_enabled: self.settings.cloud_enabled,
            identity_debounce: Duration::from_millis(self.settings.identity_debounce_ms),
            register_poll_interval,
        })
    }
}

fn validate_content_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Store content name cannot be empty");
    }
    if name.contains(['/', '\\']) {
        bail!("Store content name cannot contain path separators: {:?}", name);
    }
    Ok(())
}
