//! Live session state.
//!
//! A [`Session`] is the in-memory binding from an opaque handle to an
//! authenticated credential and remote host. Sessions are either live
//! (present in the store) or gone - expiry is enforced by eviction, never
//! by a persisted flag.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of credential backing a session.
///
/// Bearer tokens are personal, time-limited credentials from a login
/// response; application tokens are long-lived credentials created in the
/// Taiga web UI and are not tied to a user session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialKind {
    Bearer,
    Application,
}

impl CredentialKind {
    /// Scheme used in the `Authorization` header.
    pub fn scheme(&self) -> &'static str {
        match self {
            CredentialKind::Bearer => "Bearer",
            CredentialKind::Application => "Application",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Bearer" | "bearer" => Some(CredentialKind::Bearer),
            "Application" | "application" => Some(CredentialKind::Application),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A tagged secret. The token value is deliberately excluded from the
/// `Debug` output so sessions can be logged without leaking it.
#[derive(Clone)]
pub struct Credential {
    pub kind: CredentialKind,
    token: String,
    /// Refresh secret from a password login. Only bearer credentials
    /// carry one; its presence is what makes silent refresh possible.
    refresh: Option<String>,
}

impl Credential {
    pub fn new(kind: CredentialKind, token: String) -> Self {
        Self {
            kind,
            token,
            refresh: None,
        }
    }

    pub fn with_refresh(kind: CredentialKind, token: String, refresh: Option<String>) -> Self {
        Self {
            kind,
            token,
            refresh,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh.as_deref()
    }

    /// Full `Authorization` header value.
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.kind.scheme(), self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("token", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One authenticated binding to a remote host.
#[derive(Debug, Clone)]
pub struct Session {
    pub handle: String,
    pub host: String,
    pub credential: Credential,
    /// Numeric identity of the authenticated principal. Absent for
    /// application-scoped credentials, or when the who-am-I lookup failed
    /// (a documented degraded mode: project listing falls back to an
    /// unfiltered query).
    pub subject_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Absent for credentials that do not expire (application tokens).
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a session with a fresh 128-bit random handle.
    pub fn new(
        host: String,
        credential: Credential,
        subject_id: Option<i64>,
        ttl: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        Self {
            handle: Uuid::new_v4().to_string(),
            host,
            credential,
            subject_id,
            created_at: now,
            last_used_at: now,
            expires_at: ttl.and_then(|t| chrono::Duration::from_std(t).ok().map(|t| now + t)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }

    /// Time left until expiry; `None` when the session does not expire.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Whether the session is close enough to expiry that a silent
    /// refresh should be attempted before use. Only bearer credentials
    /// support refresh.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        if self.credential.kind != CredentialKind::Bearer {
            return false;
        }
        match (self.expires_at, chrono::Duration::from_std(margin)) {
            (Some(deadline), Ok(margin)) => deadline - margin <= now,
            _ => false,
        }
    }

    /// Install a refreshed credential and push the deadline out.
    pub fn renew(&mut self, credential: Credential, ttl: Duration) {
        let now = Utc::now();
        self.credential = credential;
        self.last_used_at = now;
        if let Ok(ttl) = chrono::Duration::from_std(ttl) {
            self.expires_at = Some(now + ttl);
        }
    }
}
