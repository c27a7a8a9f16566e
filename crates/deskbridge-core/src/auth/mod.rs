//! Credential checks for incoming sessions.
//!
//! The host accepts a credential when it equals either the rotating session
//! secret or the persistent unattended secret. When neither exists and
//! passwordless access is allowed, incoming sessions are authenticated as
//! soon as their conduit opens.
//!
//! Repeated failures lock the caller out for a while. Failures are kept by
//! the [`Authenticator`] rather than by sessions, keyed by the remote's base
//! identifier and also counted host-wide, so reconnecting from a fresh
//! scoped endpoint does not reset them.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SecurityConfig;
use crate::crypto::{constant_time_eq, generate_numeric_secret};
use crate::protocol::AuthVerdict;

/// Host-wide failures tolerated per `max_auth_attempts`.
const GLOBAL_ATTEMPT_FACTOR: u32 = 4;

/// Failed-attempt bookkeeping for one caller, or for the whole host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthAttempts {
    /// Consecutive failures
    pub failures: u32,
    /// Lockout expiry
    pub locked_until: Option<Instant>,
    /// Most recent failure
    pub last_failure: Option<Instant>,
}

impl AuthAttempts {
    /// Remaining lockout, if any.
    #[must_use]
    pub fn lockout_remaining(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Not locked and no failure within `window`.
    fn is_stale(&self, now: Instant, window: Duration) -> bool {
        self.lockout_remaining(now).is_none()
            && self
                .last_failure
                .map_or(true, |at| now.duration_since(at) > window)
    }

    fn record_failure(&mut self, now: Instant, limit: u32, lockout: Duration) {
        if self.is_stale(now, lockout) {
            *self = Self::default();
        }
        self.failures += 1;
        self.last_failure = Some(now);
        if self.failures >= limit {
            self.failures = 0;
            self.locked_until = Some(now + lockout);
        }
    }
}

/// Outcome of evaluating a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Verdict to send back
    pub verdict: AuthVerdict,
    /// Consecutive failures of this caller after the attempt
    pub failures: u32,
    /// Set when a lockout was in force and the credential was not looked at
    pub locked_for: Option<Duration>,
}

/// Strip the `-<millis>` suffix a scoped endpoint adds to its identifier.
fn base_identifier(remote: &str) -> &str {
    match remote.rsplit_once('-') {
        Some((base, suffix))
            if !base.is_empty()
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => remote,
    }
}

/// Holder of the host's secrets.
#[derive(Debug, Clone)]
pub struct Authenticator {
    session_secret: Option<String>,
    unattended_secret: Option<String>,
    secret_length: usize,
    allow_passwordless: bool,
    max_attempts: u32,
    lockout: Duration,
    peers: HashMap<String, AuthAttempts>,
    global: AuthAttempts,
}

impl Authenticator {
    /// Build from configuration, generating a fresh session secret.
    #[must_use]
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            session_secret: Some(generate_numeric_secret(config.session_secret_length)),
            unattended_secret: config
                .unattended_secret
                .clone()
                .filter(|s| !s.is_empty()),
            secret_length: config.session_secret_length,
            allow_passwordless: config.allow_passwordless,
            max_attempts: config.max_auth_attempts,
            lockout: config.auth_lockout,
            peers: HashMap::new(),
            global: AuthAttempts::default(),
        }
    }

    /// Current session secret.
    #[must_use]
    pub fn session_secret(&self) -> Option<&str> {
        self.session_secret.as_deref()
    }

    /// Replace (or clear) the session secret.
    pub fn set_session_secret(&mut self, secret: Option<String>) {
        self.session_secret = secret.filter(|s| !s.is_empty());
    }

    /// Replace (or clear) the unattended secret.
    pub fn set_unattended_secret(&mut self, secret: Option<String>) {
        self.unattended_secret = secret.filter(|s| !s.is_empty());
    }

    /// Generate and install a new session secret.
    pub fn rotate(&mut self) -> String {
        let secret = generate_numeric_secret(self.secret_length);
        self.session_secret = Some(secret.clone());
        secret
    }

    /// Whether incoming sessions need no credential at all.
    #[must_use]
    pub fn is_passwordless(&self) -> bool {
        self.allow_passwordless && self.session_secret.is_none() && self.unattended_secret.is_none()
    }

    /// Whether `credential` matches either secret.
    #[must_use]
    pub fn verify(&self, credential: &str) -> bool {
        let matches = |secret: &Option<String>| {
            secret
                .as_deref()
                .is_some_and(|s| constant_time_eq(s.as_bytes(), credential.as_bytes()))
        };
        // Evaluate both so timing does not reveal which secret exists.
        let session = matches(&self.session_secret);
        let unattended = matches(&self.unattended_secret);
        session | unattended
    }

    /// Evaluate a credential from `remote`, recording the outcome.
    ///
    /// While `remote` or the host as a whole is locked out, every credential
    /// fails without being compared.
    pub fn evaluate(&mut self, remote: &str, credential: &str, now: Instant) -> Evaluation {
        let window = self.lockout;
        self.peers.retain(|_, attempts| !attempts.is_stale(now, window));

        let key = base_identifier(remote);
        let peer = self.peers.get(key).copied().unwrap_or_default();
        let locked_for = peer
            .lockout_remaining(now)
            .max(self.global.lockout_remaining(now));
        if locked_for.is_some() {
            return Evaluation {
                verdict: AuthVerdict::Fail,
                failures: peer.failures,
                locked_for,
            };
        }

        if self.verify(credential) {
            self.peers.remove(key);
            self.global = AuthAttempts::default();
            return Evaluation {
                verdict: AuthVerdict::Ok,
                failures: 0,
                locked_for: None,
            };
        }

        if self.max_attempts == 0 {
            return Evaluation {
                verdict: AuthVerdict::Fail,
                failures: 0,
                locked_for: None,
            };
        }

        let peer = self.peers.entry(key.to_string()).or_default();
        peer.record_failure(now, self.max_attempts, self.lockout);
        let failures = peer.failures;
        self.global.record_failure(
            now,
            self.max_attempts.saturating_mul(GLOBAL_ATTEMPT_FACTOR),
            self.lockout,
        );

        Evaluation {
            verdict: AuthVerdict::Fail,
            failures,
            locked_for: None,
        }
    }
}
