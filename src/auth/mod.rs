//! Session and access-control core.
//!
//! This module turns a bare username/password or token into a reusable,
//! time-bounded, rate-limited handle:
//!
//! - `session`: the live session and credential types
//! - `store`: the concurrency-safe session table and expiry sweep
//! - `vault`: durable, permission-restricted token cache
//! - `authenticator`: orchestration of login, logout, status and refresh

pub mod authenticator;
pub mod session;
pub mod store;
pub mod vault;

pub use authenticator::{Authenticator, HealthReport, LogoutOutcome, SessionStatus};
pub use session::{Credential, CredentialKind, Session};
pub use store::SessionStore;
pub use vault::{CachedToken, TokenMetadata, Vault};
