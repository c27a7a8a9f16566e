//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use deskbridge_core::config::Config;

pub mod completions;
pub mod config;
pub mod contacts;
pub mod id;
pub mod secret;
pub mod status;

/// Load configuration with graceful fallback to defaults.
///
/// A missing or unreadable file yields the default configuration so that
/// read-only commands keep working.
pub fn load_config(path: &Path) -> Config {
    Config::load_from(path).unwrap_or_default()
}

/// Load configuration strictly, for commands that write it back.
pub fn load_config_strict(path: &Path) -> Result<Config> {
    Config::load_from(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Print a value as pretty JSON.
pub fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// DeskBridge - peer-to-peer remote desktop companion
#[derive(Parser)]
#[command(name = "deskbridge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,

    /// Use a specific configuration file
    #[arg(long = "config", global = true, env = "DESKBRIDGE_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    /// Configuration file in effect.
    pub fn config_path(&self) -> PathBuf {
        self.config_file.clone().unwrap_or_else(Config::config_path)
    }
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Show the local endpoint identifier
    Id(IdArgs),

    /// Manage the address book
    Contacts(ContactsArgs),

    /// List recently connected identifiers
    Recent(RecentArgs),

    /// Check which contacts are online
    Status(StatusArgs),

    /// Manage configuration
    Config(ConfigArgs),

    /// Generate or store access secrets
    Secret(SecretArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Arguments for the id command
#[derive(Parser)]
pub struct IdArgs {
    /// Discard the stored identifier and generate a new one
    #[arg(long)]
    pub regenerate: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the contacts command
#[derive(Parser)]
pub struct ContactsArgs {
    /// Contacts subcommand
    #[command(subcommand)]
    pub action: ContactsAction,
}

/// Contacts subcommands
#[derive(Subcommand)]
pub enum ContactsAction {
    /// List contacts, favourites first
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Add or update a contact
    Add {
        /// Remote identifier
        identifier: String,

        /// Display alias
        #[arg(long)]
        alias: Option<String>,

        /// Group name
        #[arg(long)]
        group: Option<String>,

        /// Pin to the top of the list
        #[arg(long)]
        favorite: bool,
    },

    /// Remove a contact
    Remove {
        /// Remote identifier
        identifier: String,
    },

    /// Forget the credential remembered for a contact
    Forget {
        /// Remote identifier
        identifier: String,
    },
}

/// Arguments for the recent command
#[derive(Parser)]
pub struct RecentArgs {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the status command
#[derive(Parser)]
pub struct StatusArgs {
    /// Identifiers to check (defaults to every contact)
    pub identifiers: Vec<String>,

    /// Keep checking every configured interval until interrupted
    #[arg(short, long)]
    pub watch: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g. broker.host)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Value to set
        value: String,
    },

    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}

/// Arguments for the secret command
#[derive(Parser)]
pub struct SecretArgs {
    /// Secret subcommand
    #[command(subcommand)]
    pub action: SecretAction,
}

/// Secret subcommands
#[derive(Subcommand)]
pub enum SecretAction {
    /// Print a fresh session secret of the configured length
    Generate,

    /// Store the unattended-access secret (generated when omitted)
    SetUnattended {
        /// Secret to store
        secret: Option<String>,
    },

    /// Remove the unattended-access secret
    ClearUnattended,
}

/// Arguments for the completions command
#[derive(Parser)]
pub struct CompletionsArgs {
    /// Completions subcommand
    #[command(subcommand)]
    pub action: CompletionsAction,
}

/// Completions subcommands
#[derive(Subcommand, Clone, Copy)]
pub enum CompletionsAction {
    /// Install shell completions (auto-detects shell)
    Install {
        /// Override shell detection
        #[arg(long, value_enum)]
        shell: Option<ShellType>,
    },

    /// Uninstall shell completions
    Uninstall {
        /// Override shell detection
        #[arg(long, value_enum)]
        shell: Option<ShellType>,
    },

    /// Generate completions and print to stdout (for manual installation)
    Generate {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: ShellType,
    },
}

/// Supported shell types for completions
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum ShellType {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    #[value(name = "powershell")]
    PowerShell,
    /// Elvish shell
    Elvish,
}
