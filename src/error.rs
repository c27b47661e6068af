//! Error taxonomy for the bridge core.
//!
//! Every fallible operation in the crate returns [`BridgeError`]. The
//! variants map one-to-one onto the conditions callers can act on:
//! re-authenticate (`SessionNotFound`), back off (`RateLimited`), fix
//! input (`Validation`), or give up (`RemoteUnavailable`).
//!
//! Error messages carry host names and identifiers only - never token or
//! password material.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed caller input. Never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The remote rejected a username/password login.
    #[error("authentication rejected by {host}")]
    InvalidCredentials { host: String },

    /// The remote rejected a token outright.
    #[error("token rejected by {host}")]
    InvalidToken { host: String },

    /// Unknown or already-swept session handle. Callers must log in again.
    #[error("unknown or expired session '{0}'")]
    SessionNotFound(String),

    /// Local token-bucket backpressure. A policy signal, not a fault -
    /// this layer never retries it on the caller's behalf.
    #[error("rate limit exceeded, retry in {}ms ({remaining} tokens remaining)", retry_after.as_millis())]
    RateLimited {
        remaining: u32,
        retry_after: Duration,
    },

    /// Retry budget exhausted on a transient remote fault.
    #[error("remote unavailable after {attempts} attempts")]
    RemoteUnavailable {
        attempts: u32,
        #[source]
        source: Box<BridgeError>,
    },

    /// The remote detected a concurrent write (HTTP 409). Surfaced as-is;
    /// a blind retry could silently overwrite someone else's change.
    #[error("version conflict: resource was modified concurrently")]
    VersionConflict,

    /// Transient remote failure: HTTP 429 or 5xx. Candidates for retry
    /// inside the retry envelope; `retry_after` carries a server-provided
    /// Retry-After hint when one was present.
    #[error("remote returned HTTP {status}")]
    RemoteStatus {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Permanent remote rejection: a 4xx other than 401/403/409/429.
    /// Propagates on first occurrence, no retry budget spent.
    #[error("remote rejected request with HTTP {status}: {detail}")]
    Rejected { status: u16, detail: String },

    /// Response body could not be parsed as the expected JSON shape.
    #[error("invalid response from remote: {0}")]
    InvalidResponse(String),

    /// No cached token on disk for this (host, identifier).
    #[error("no cached token for {host} ({identifier})")]
    TokenNotFound { host: String, identifier: String },

    /// A cache file exists but cannot be parsed. The file is left in
    /// place for operator inspection - never auto-deleted.
    #[error("corrupt token cache file {}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Vault-level filesystem failure.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level HTTP failure (connection reset, timeout, TLS).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Maximum length of a response body echoed into an error message.
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl BridgeError {
    /// Truncate a response body so error messages stay bounded.
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            // Back off to a character boundary so the slice cannot panic.
            let mut cut = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..cut],
                body.len()
            )
        }
    }

    /// Map a non-success HTTP status from a routine API call into an error.
    ///
    /// 401/403 are reported as `InvalidToken` (the session credential was
    /// revoked or expired remotely), 409 as `VersionConflict`, 429/5xx as
    /// transient `RemoteStatus`, everything else as a permanent `Rejected`.
    pub fn from_status(
        status: reqwest::StatusCode,
        host: &str,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        match status.as_u16() {
            401 | 403 => BridgeError::InvalidToken {
                host: host.to_string(),
            },
            409 => BridgeError::VersionConflict,
            429 => BridgeError::RemoteStatus {
                status: 429,
                retry_after,
            },
            500..=599 => BridgeError::RemoteStatus {
                status: status.as_u16(),
                retry_after: None,
            },
            _ => BridgeError::Rejected {
                status: status.as_u16(),
                detail: Self::truncate_body(body),
            },
        }
    }

    /// Whether the retry envelope may spend budget on this failure.
    ///
    /// Transient: connection-level transport errors, timeouts, HTTP 429
    /// and 5xx. Everything else is permanent and propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::RemoteStatus { status, .. } => *status == 429 || *status >= 500,
            BridgeError::Network(e) => !(e.is_builder() || e.is_decode()),
            _ => false,
        }
    }

    /// Server-provided Retry-After hint, if this failure carried one.
    pub fn retry_after_hint(&self) -> Option<Duration> {
        match self {
            BridgeError::RemoteStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
