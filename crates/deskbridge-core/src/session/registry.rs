//! In-memory session registry.

use tracing::debug;

use super::{ChannelRole, Direction, Session, SessionId, SessionSnapshot, SessionUpdate};
use crate::error::{Error, Result};
use crate::transport::{ChannelId, EndpointId};

/// Every live session, in creation order.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its id.
    pub fn create(&mut self, remote_identifier: &str, direction: Direction) -> SessionId {
        let id = SessionId::new();
        self.sessions
            .push(Session::new(id, remote_identifier.to_string(), direction));
        debug!(session = %id, remote = %remote_identifier, %direction, "Session registered");
        id
    }

    /// Merge a partial update into a session.
    ///
    /// This is the only way session state changes.
    pub fn update(&mut self, id: SessionId, update: SessionUpdate) -> Result<&Session> {
        let session = self
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(Error::SessionNotFound(id))?;
        session.apply(update);
        Ok(session)
    }

    /// Remove a session, handing ownership to the caller for release.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(index))
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Find the session talking to `remote` in the given role.
    #[must_use]
    pub fn find_by_remote(&self, remote: &str, direction: Direction) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|s| s.direction == direction && s.remote_identifier == remote)
            .map(|s| s.id)
    }

    /// Find the session owning a scoped endpoint.
    #[must_use]
    pub fn find_by_endpoint(&self, endpoint: EndpointId) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|s| s.owns_endpoint(endpoint))
            .map(|s| s.id)
    }

    /// Find the session owning a channel, and which handle it is.
    #[must_use]
    pub fn find_by_channel(&self, channel: ChannelId) -> Option<(SessionId, ChannelRole)> {
        self.sessions
            .iter()
            .find_map(|s| s.channel_role(channel).map(|role| (s.id, role)))
    }

    /// Ids of all sessions, in creation order.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.id).collect()
    }

    /// Iterate over sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    /// Read models of all sessions.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(Session::snapshot).collect()
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
