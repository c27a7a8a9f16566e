//! Handover tokens.
//!
//! A client that moves a session to a new endpoint (for example a detached
//! window) first sends `HANDOVER_PREPARATION{token}` over the old conduit.
//! The host records the token; the new endpoint then presents it as
//! invitation metadata on both its media and data channels and skips the
//! approval prompt.
//!
//! A token stays valid for a short grace period after its first successful
//! validation so that both channels of the reconnect can present it, then
//! it is gone. A token nobody presents is dropped after
//! `grace * UNCLAIMED_GRACE_FACTOR`. A token never authorizes remote input
//! by itself.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// How many grace periods an announced token waits to be presented.
pub const UNCLAIMED_GRACE_FACTOR: u32 = 30;

#[derive(Debug, Clone, Copy)]
struct Entry {
    announced: Instant,
    /// Set on first validation
    expires: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant, unclaimed: Duration) -> bool {
        match self.expires {
            Some(at) => at > now,
            None => self.announced + unclaimed > now,
        }
    }
}

/// Set of outstanding handover tokens.
#[derive(Debug)]
pub struct HandoverTokens {
    tokens: HashMap<String, Entry>,
    grace: Duration,
}

impl HandoverTokens {
    /// Create an empty set with the given post-validation grace period.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            tokens: HashMap::new(),
            grace,
        }
    }

    fn unclaimed(&self) -> Duration {
        self.grace.saturating_mul(UNCLAIMED_GRACE_FACTOR)
    }

    /// Record a token announced by a peer.
    pub fn record(&mut self, token: impl Into<String>, now: Instant) {
        self.purge(now);
        self.tokens.entry(token.into()).or_insert(Entry {
            announced: now,
            expires: None,
        });
    }

    /// Validate a presented token.
    ///
    /// The first validation starts the grace period; after it expires the
    /// token no longer validates.
    pub fn validate(&mut self, token: &str, now: Instant) -> bool {
        self.purge(now);
        match self.tokens.get_mut(token) {
            Some(entry) => {
                entry.expires.get_or_insert(now + self.grace);
                true
            }
            None => false,
        }
    }

    /// Whether a token is known, without starting its grace period.
    #[must_use]
    pub fn contains(&self, token: &str, now: Instant) -> bool {
        let unclaimed = self.unclaimed();
        self.tokens
            .get(token)
            .is_some_and(|entry| entry.is_live(now, unclaimed))
    }

    /// Drop tokens whose grace period is over, and tokens never presented.
    pub fn purge(&mut self, now: Instant) {
        let unclaimed = self.unclaimed();
        self.tokens.retain(|_, entry| entry.is_live(now, unclaimed));
    }

    /// Number of tokens held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
