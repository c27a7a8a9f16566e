//! Address book of remote identifiers.
//!
//! Contacts carry presentation data (alias, group, favourite flag, cached
//! thumbnail) plus an optional remembered credential that the engine supplies
//! automatically on outbound connect. The book also tracks the recently used
//! identifiers, most recent first.
//!
//! The book is stored as JSON next to the identity file:
//!
//! ```json
//! { "version": 1, "contacts": [...], "recent": ["123456789"] }
//! ```

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A persisted address book entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Remote endpoint identifier
    pub identifier: String,
    /// Display alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Group name for organisation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Pinned to the top of lists
    #[serde(default)]
    pub favorite: bool,
    /// Credential supplied automatically on connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remembered_credential: Option<String>,
    /// Cached preview image (data URL)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// When the entry was created
    pub added_at: DateTime<Utc>,
    /// Last successful connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

impl Contact {
    /// Create a bare contact for an identifier.
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            alias: None,
            group: None,
            favorite: false,
            remembered_credential: None,
            thumbnail: None,
            added_at: Utc::now(),
            last_connected: None,
        }
    }

    /// Set the alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Mark as favourite.
    #[must_use]
    pub const fn favorite(mut self, favorite: bool) -> Self {
        self.favorite = favorite;
        self
    }

    /// Alias if set, otherwise the identifier.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.identifier)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AddressBookFile {
    version: u32,
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    recent: Vec<String>,
}

/// Persistent collection of contacts and recent identifiers.
#[derive(Debug, Default)]
pub struct AddressBook {
    /// Backing file; `None` keeps the book in memory only
    path: Option<PathBuf>,
    contacts: Vec<Contact>,
    recent: Vec<String>,
}

impl AddressBook {
    /// An address book that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the address book from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = Self::default_path().unwrap_or_else(|| PathBuf::from("contacts.json"));
        Self::load_from(path)
    }

    /// Load from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: Some(path),
                ..Self::default()
            });
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::AddressBookError(format!("Failed to open {}: {e}", path.display()))
        })?;
        let db: AddressBookFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::AddressBookError(format!("Failed to parse {}: {e}", path.display()))
        })?;

        Ok(Self {
            path: Some(path),
            contacts: db.contacts,
            recent: db.recent,
        })
    }

    /// Get the default address book path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        crate::config::Config::data_dir().map(|dir| dir.join("contacts.json"))
    }

    /// Write the book to its backing file, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::AddressBookError(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let db = AddressBookFile {
            version: 1,
            contacts: self.contacts.clone(),
            recent: self.recent.clone(),
        };

        let file = fs::File::create(path).map_err(|e| {
            Error::AddressBookError(format!("Failed to create {}: {e}", path.display()))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &db).map_err(|e| {
            Error::AddressBookError(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// All contacts, favourites first, then by display name.
    #[must_use]
    pub fn list(&self) -> Vec<&Contact> {
        let mut contacts: Vec<&Contact> = self.contacts.iter().collect();
        contacts.sort_by(|a, b| {
            b.favorite
                .cmp(&a.favorite)
                .then_with(|| a.display_name().cmp(b.display_name()))
        });
        contacts
    }

    /// Find a contact by identifier.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.identifier == identifier)
    }

    fn get_mut(&mut self, identifier: &str) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.identifier == identifier)
    }

    /// Insert or replace a contact.
    pub fn upsert(&mut self, contact: Contact) {
        if let Some(existing) = self.get_mut(&contact.identifier) {
            *existing = contact;
        } else {
            self.contacts.push(contact);
        }
    }

    /// Register an identifier if it is not known yet. Returns true when added.
    pub fn ensure(&mut self, identifier: &str) -> bool {
        if self.get(identifier).is_some() {
            return false;
        }
        self.contacts.push(Contact::new(identifier));
        true
    }

    /// Remove a contact. Returns true if it existed.
    pub fn remove(&mut self, identifier: &str) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|c| c.identifier != identifier);
        self.contacts.len() != before
    }

    /// Credential remembered for an identifier.
    #[must_use]
    pub fn remembered_credential(&self, identifier: &str) -> Option<&str> {
        self.get(identifier)
            .and_then(|c| c.remembered_credential.as_deref())
    }

    /// Remember a credential, creating the contact when needed.
    pub fn remember_credential(&mut self, identifier: &str, credential: &str) {
        self.ensure(identifier);
        if let Some(contact) = self.get_mut(identifier) {
            contact.remembered_credential = Some(credential.to_string());
        }
    }

    /// Drop a remembered credential. Returns true if one was stored.
    pub fn forget_credential(&mut self, identifier: &str) -> bool {
        self.get_mut(identifier)
            .and_then(|c| c.remembered_credential.take())
            .is_some()
    }

    /// Stamp a successful connection.
    pub fn mark_connected(&mut self, identifier: &str) {
        if let Some(contact) = self.get_mut(identifier) {
            contact.last_connected = Some(Utc::now());
        }
    }

    /// Cache a preview image for a contact.
    pub fn set_thumbnail(&mut self, identifier: &str, thumbnail: String) {
        if let Some(contact) = self.get_mut(identifier) {
            contact.thumbnail = Some(thumbnail);
        }
    }

    /// Move an identifier to the front of the recent list, keeping at most `limit`.
    pub fn push_recent(&mut self, identifier: &str, limit: usize) {
        self.recent.retain(|r| r != identifier);
        self.recent.insert(0, identifier.to_string());
        self.recent.truncate(limit);
    }

    /// Recent identifiers, most recent first.
    #[must_use]
    pub fn recent(&self) -> &[String] {
        &self.recent
    }
}
