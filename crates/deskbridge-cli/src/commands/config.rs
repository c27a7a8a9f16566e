//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use deskbridge_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command against the file at `path`.
pub fn run(args: ConfigArgs, path: &Path) -> Result<()> {
    match args.action {
        ConfigAction::Get { key } => {
            let config = super::load_config(path);
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            set_value(path, &key, &value)?;
            println!("{key} = {value}");
        }
        ConfigAction::Show => {
            let config = super::load_config(path);
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to render configuration")?
            );
        }
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Reset => {
            Config::default().save_to(path)?;
            println!("Configuration reset: {}", path.display());
        }
    }
    Ok(())
}

/// Validate and persist one dotted key.
fn set_value(path: &Path, key: &str, value: &str) -> Result<()> {
    let mut config = super::load_config_strict(path)?;
    config.set(key, value)?;
    config.save_to(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_value_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        set_value(&path, "broker.host", "10.0.0.5").unwrap();
        set_value(&path, "broker.port", "9100").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 9100);
    }

    #[test]
    fn test_set_value_rejects_bad_input() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        assert!(set_value(&path, "broker.port", "lots").is_err());
        assert!(set_value(&path, "broker.nope", "1").is_err());
        assert!(!path.exists());
    }
}
