//! Local endpoint identity.
//!
//! Every process registers with the broker under a stable identifier: a
//! 9-digit number generated once and persisted in the data directory.
//! Secondary windows and tests pass an explicit identifier instead.

use std::fs;
use std::path::PathBuf;

use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};

/// Number of digits in a generated identifier.
pub const IDENTIFIER_DIGITS: u32 = 9;

/// Resolves the local endpoint identifier.
///
/// Implementations must be idempotent: repeated calls return the same value.
pub trait IdentityProvider: Send + Sync {
    /// Resolve the identifier, creating and persisting it if needed.
    fn resolve(&self) -> Result<String>;
}

/// Identifier persisted to a file.
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    path: PathBuf,
}

impl StoredIdentity {
    /// Identity stored at a specific path.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Identity stored in the default data directory.
    #[must_use]
    pub fn default_location() -> Self {
        let path = crate::config::Config::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("identity");
        Self::new(path)
    }

    /// Path of the identity file.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl IdentityProvider for StoredIdentity {
    fn resolve(&self) -> Result<String> {
        if self.path.exists() {
            let stored = fs::read_to_string(&self.path).map_err(|e| {
                Error::IdentityError(format!("Failed to read {}: {e}", self.path.display()))
            })?;
            let stored = stored.trim();
            if is_valid_identifier(stored) {
                return Ok(stored.to_string());
            }
            debug!(path = %self.path.display(), "Stored identifier is malformed, regenerating");
        }

        let identifier = generate_identifier();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IdentityError(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        fs::write(&self.path, &identifier).map_err(|e| {
            Error::IdentityError(format!("Failed to write {}: {e}", self.path.display()))
        })?;

        debug!(identifier = %identifier, "Generated local identifier");
        Ok(identifier)
    }
}

/// Caller-supplied identifier for isolated windows.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub String);

impl IdentityProvider for FixedIdentity {
    fn resolve(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(Error::IdentityError("identifier is empty".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Generate a random 9-digit identifier without a leading zero.
#[must_use]
pub fn generate_identifier() -> String {
    let low = 10u32.pow(IDENTIFIER_DIGITS - 1);
    let high = 10u32.pow(IDENTIFIER_DIGITS);
    rand::thread_rng().gen_range(low..high).to_string()
}

/// Whether a string looks like a generated identifier.
#[must_use]
pub fn is_valid_identifier(s: &str) -> bool {
    s.len() == IDENTIFIER_DIGITS as usize
        && s.bytes().all(|b| b.is_ascii_digit())
        && !s.starts_with('0')
}
