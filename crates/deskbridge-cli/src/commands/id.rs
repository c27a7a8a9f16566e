//! Id command implementation.

use std::fs;

use anyhow::{Context, Result};

use deskbridge_core::identity::{IdentityProvider, StoredIdentity};

use super::IdArgs;

/// Run the id command.
pub fn run(args: &IdArgs) -> Result<()> {
    let identity = StoredIdentity::default_location();

    if args.regenerate && identity.path().exists() {
        fs::remove_file(identity.path())
            .with_context(|| format!("Failed to remove {}", identity.path().display()))?;
    }

    let identifier = identity.resolve().context("Failed to resolve identifier")?;

    if args.json {
        return super::print_json(&serde_json::json!({
            "identifier": identifier,
            "path": identity.path().display().to_string(),
        }));
    }

    println!("{}", format_identifier(&identifier));
    Ok(())
}

/// Group digits in threes for reading aloud.
fn format_identifier(identifier: &str) -> String {
    identifier
        .as_bytes()
        .chunks(3)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
