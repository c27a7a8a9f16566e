//! Secret command implementation.

use std::path::Path;

use anyhow::{bail, Result};

use deskbridge_core::crypto::generate_numeric_secret;

use super::{SecretAction, SecretArgs};

/// Shortest unattended secret accepted.
const MIN_UNATTENDED_LEN: usize = 6;

/// Run the secret command.
pub fn run(args: &SecretArgs, path: &Path) -> Result<()> {
    match &args.action {
        SecretAction::Generate => {
            let config = super::load_config(path);
            println!(
                "{}",
                generate_numeric_secret(config.security.session_secret_length)
            );
        }
        SecretAction::SetUnattended { secret } => {
            let mut config = super::load_config_strict(path)?;
            let secret = match secret {
                Some(s) => validate_unattended(s)?,
                None => generate_numeric_secret(
                    config.security.session_secret_length.max(MIN_UNATTENDED_LEN),
                ),
            };
            config.security.unattended_secret = Some(secret.clone());
            config.save_to(path)?;
            println!("Unattended secret: {secret}");
        }
        SecretAction::ClearUnattended => {
            let mut config = super::load_config_strict(path)?;
            if config.security.unattended_secret.take().is_none() {
                println!("No unattended secret is set.");
                return Ok(());
            }
            config.save_to(path)?;
            println!("Unattended secret removed.");
        }
    }
    Ok(())
}

fn validate_unattended(secret: &str) -> Result<String> {
    let secret = secret.trim();
    if secret.chars().count() < MIN_UNATTENDED_LEN {
        bail!("Unattended secret must be at least {MIN_UNATTENDED_LEN} characters");
    }
    Ok(secret.to_string())
}
