//! Ubiquity CLI
//!
//! Command-line interface for ubiquity - inspect and switch between the
//! local and cloud stores.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ubiquity_core::{ErrorCause, Settings, StoreConfiguration, StoreError, StoreManager};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "ubiquity")]
#[command(about = "Ubiquity - local and cloud store switching")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// More logging (repeat for more)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store name (defaults to the configured content name)
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the active store and cloud state
    Status,
    /// Show every store location
    Paths,
    /// Turn the cloud store on or off
    Cloud {
        #[command(subcommand)]
        command: CloudCommands,
    },
    /// Check whether the local store may seed the cloud
    SeedCheck,
    /// Wipe the cloud container and start a new cloud store
    Nuke {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete the local store file
    DeleteLocal {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete the current cloud store file
    DeleteCloud {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Manage records in the active store
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum CloudCommands {
    /// Use the cloud store
    Enable,
    /// Use the local store
    Disable,
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Add a record
    #[command(alias = "create")]
    Add {
        /// Entity name
        entity: String,
        /// Payload as JSON
        payload: String,
    },
    /// List all records
    #[command(alias = "ls")]
    List {
        /// Only records of this entity
        #[arg(short, long)]
        entity: Option<String>,
    },
    /// Show one record
    Show {
        /// Record ID
        id: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, cloud_root, container_identity, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands don't need a store
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), cli.config.as_ref(), &output);
    }

    let manager = open_manager(cli.config.as_ref(), cli.store.clone(), &output).await?;

    match cli.command {
        Commands::Status => commands::status::show(&manager, &output).await,
        Commands::Paths => commands::status::paths(&manager, &output),
        Commands::Cloud { command } => {
            let enabled = matches!(command, CloudCommands::Enable);
            commands::cloud::set_enabled(&manager, enabled, &output).await
        }
        Commands::SeedCheck => commands::cloud::seed_check(&manager, &output).await,
        Commands::Nuke { yes } => commands::cloud::nuke(&manager, yes, &output).await,
        Commands::DeleteLocal { yes } => commands::cloud::delete_local(&manager, yes, &output).await,
        Commands::DeleteCloud { yes } => commands::cloud::delete_cloud(&manager, yes, &output).await,
        Commands::Record { command } => handle_record_command(command, &manager, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_record_command(
    command: RecordCommands,
    manager: &StoreManager,
    output: &Output,
) -> Result<()> {
    match command {
        RecordCommands::Add { entity, payload } => {
            commands::record::add(manager, entity, payload, output)
        }
        RecordCommands::List { entity } => commands::record::list(manager, entity, output),
        RecordCommands::Show { id } => commands::record::show(manager, id, output),
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Open the manager and wait for its initial store to attach
async fn open_manager(
    config_path: Option<&PathBuf>,
    store: Option<String>,
    output: &Output,
) -> Result<StoreManager> {
    let settings = match config_path {
        Some(path) => Settings::load_from_path(path),
        None => Settings::load(),
    }
    .context("Failed to load configuration")?;

    let overrides = match store {
        Some(name) => StoreConfiguration::named(name),
        None => StoreConfiguration::default(),
    };
    let manager = StoreManager::open_with_settings(&settings, overrides)
        .context("Failed to open store manager")?;

    if !output.is_quiet() {
        manager.on_error(|err, cause, _| {
            eprintln!("{}", failure_message(err, cause));
        });
    }

    manager.settle().await;
    Ok(manager)
}

/// Warning for a manager error, with a hint when one is known
fn failure_message(err: &StoreError, cause: ErrorCause) -> String {
    let mut message = format!("⚠ Failed to {}: {}", cause, err);
    if let Some(hint) = err.recovery_suggestion() {
        message.push_str("\n  ");
        message.push_str(hint);
    }
    if err.is_recoverable() {
        message.push_str("\n  Run the command again once this is fixed.");
    }
    message
}

/// Log to stderr; `RUST_LOG` wins when no `--verbose` is given
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = if verbose == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("ubiquity_core={},ubiquity_cli={}", level, level))
        })
    } else {
        EnvFilter::new(format!("ubiquity_core={},ubiquity_cli={}", level, level))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
