//! Shell completions generation and installation.

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use anyhow::{bail, Context, Result};
use clap::CommandFactory;
use clap_complete::{generate, Shell};

use super::{Cli, CompletionsAction, ShellType};

const BIN_NAME: &str = "deskbridge";

impl From<ShellType> for Shell {
    fn from(shell: ShellType) -> Self {
        match shell {
            ShellType::Bash => Self::Bash,
            ShellType::Zsh => Self::Zsh,
            ShellType::Fish => Self::Fish,
            ShellType::PowerShell => Self::PowerShell,
            ShellType::Elvish => Self::Elvish,
        }
    }
}

/// Run the completions command.
pub fn run(action: CompletionsAction) -> Result<()> {
    match action {
        CompletionsAction::Generate { shell } => {
            generate(
                Shell::from(shell),
                &mut Cli::command(),
                BIN_NAME,
                &mut io::stdout(),
            );
            Ok(())
        }
        CompletionsAction::Install { shell } => {
            let shell = shell.map_or_else(detect_shell, Ok)?;
            let path = install_path(shell, &home_dir()?);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(&path, render(shell))
                .with_context(|| format!("Failed to write {}", path.display()))?;

            println!("Installed {shell:?} completions to {}", path.display());
            println!();
            println!("{}", activation_hint(shell, &path));
            Ok(())
        }
        CompletionsAction::Uninstall { shell } => {
            let shell = shell.map_or_else(detect_shell, Ok)?;
            let path = install_path(shell, &home_dir()?);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                println!("Removed {shell:?} completions from {}", path.display());
            } else {
                println!("No completions installed at {}", path.display());
            }
            Ok(())
        }
    }
}

fn render(shell: ShellType) -> Vec<u8> {
    let mut buf = Vec::new();
    generate(Shell::from(shell), &mut Cli::command(), BIN_NAME, &mut buf);
    buf
}

/// Detect the user's shell from `$SHELL`.
fn detect_shell() -> Result<ShellType> {
    let shell = env::var("SHELL").context("$SHELL is not set; pass --shell explicitly")?;
    let name = shell.rsplit('/').next().unwrap_or(&shell).to_lowercase();

    Ok(match name.as_str() {
        "bash" => ShellType::Bash,
        "zsh" => ShellType::Zsh,
        "fish" => ShellType::Fish,
        "pwsh" | "powershell" => ShellType::PowerShell,
        "elvish" => ShellType::Elvish,
        other => bail!("Unsupported shell '{other}'; pass --shell explicitly"),
    })
}

fn home_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

fn xdg_dir(var: &str, home: &Path, fallback: &str) -> PathBuf {
    env::var_os(var)
        .filter(|v| !v.is_empty())
        .map_or_else(|| home.join(fallback), PathBuf::from)
}

/// Where completions for `shell` are installed.
fn install_path(shell: ShellType, home: &Path) -> PathBuf {
    match shell {
        ShellType::Bash => xdg_dir("XDG_DATA_HOME", home, ".local/share")
            .join("bash-completion/completions")
            .join(BIN_NAME),
        ShellType::Zsh => xdg_dir("XDG_DATA_HOME", home, ".local/share")
            .join("zsh/site-functions")
            .join(format!("_{BIN_NAME}")),
        ShellType::Fish => xdg_dir("XDG_CONFIG_HOME", home, ".config")
            .join("fish/completions")
            .join(format!("{BIN_NAME}.fish")),
        ShellType::PowerShell if cfg!(windows) => home
            .join("Documents/PowerShell/Modules/DeskBridgeCompletion")
            .join("DeskBridgeCompletion.psm1"),
        ShellType::PowerShell => home
            .join(".config/powershell/Microsoft.PowerShell_profile.d")
            .join(format!("{BIN_NAME}.ps1")),
        ShellType::Elvish => home.join(".elvish/lib").join(format!("{BIN_NAME}.elv")),
    }
}

fn activation_hint(shell: ShellType, path: &Path) -> String {
    match shell {
        ShellType::Bash | ShellType::Fish => {
            format!("Open a new shell, or run: source {}", path.display())
        }
        ShellType::Zsh => "Make sure ~/.local/share/zsh/site-functions is on $fpath, \
                           then run: autoload -Uz compinit && compinit"
            .to_string(),
        ShellType::PowerShell => {
            format!("Add to your profile: Import-Module {}", path.display())
        }
        ShellType::Elvish => format!("Add to ~/.elvish/rc.elv: use {BIN_NAME}"),
    }
}
