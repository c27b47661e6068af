//! Session creation, teardown and inspection.
//!
//! The authenticator turns one of three inputs - username/password, an
//! explicit token, or a cached token - into a live session handle, and is
//! the only component that writes to both the session store and the
//! credential vault. It holds no session state of its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::config::Config;
use crate::error::{BridgeError, Result};

use super::session::{Credential, CredentialKind, Session};
use super::store::SessionStore;
use super::vault::{CachedToken, Vault};

/// Result of a logout call. Logging out an unknown handle is not an
/// error - the caller learns which case occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutOutcome {
    LoggedOut,
    AlreadyGone,
}

/// Snapshot returned by `status`. A pure read: taking a status never
/// counts as session use.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub exists: bool,
    pub live: bool,
    pub host: Option<String>,
    pub subject_id: Option<i64>,
    pub remaining_ttl_seconds: Option<u64>,
}

impl SessionStatus {
    fn missing() -> Self {
        Self {
            exists: false,
            live: false,
            host: None,
            subject_id: None,
            remaining_ttl_seconds: None,
        }
    }
}

/// Health check result. Mirrors `status` but adds one live API
/// round-trip.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub session_active: bool,
    pub api_accessible: bool,
    pub host: Option<String>,
    pub subject_id: Option<i64>,
    pub details: String,
}

pub struct Authenticator {
    api: ApiClient,
    store: Arc<SessionStore>,
    vault: Arc<Vault>,
    session_ttl: Duration,
    refresh_margin: Duration,
}

impl Authenticator {
    pub fn new(api: ApiClient, store: Arc<SessionStore>, vault: Arc<Vault>, config: &Config) -> Self {
        Self {
            api,
            store,
            vault,
            session_ttl: Duration::from_secs(config.session_expiry_seconds),
            refresh_margin: Duration::from_secs(config.refresh_margin_seconds),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    fn require_nonempty(value: &str, name: &str) -> Result<()> {
        if value.trim().is_empty() {
            Err(BridgeError::Validation(format!("{name} must not be empty")))
        } else {
            Ok(())
        }
    }

    /// Exchange username/password for a bearer session.
    pub async fn authenticate_with_credentials(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<String> {
        Self::require_nonempty(host, "host")?;
        Self::require_nonempty(username, "username")?;
        Self::require_nonempty(password, "password")?;

        let response = self.api.login(host, username, password).await?;
        let credential = Credential::with_refresh(
            CredentialKind::Bearer,
            response.auth_token,
            response.refresh,
        );
        let session = Session::new(
            host.to_string(),
            credential,
            response.id,
            Some(self.session_ttl),
        );
        let handle = session.handle.clone();
        self.store.put(session);
        info!(host, username, "password login succeeded");
        Ok(handle)
    }

    /// Create a session from an explicit token.
    ///
    /// For a bearer token with no known subject, one who-am-I call
    /// resolves the identity. If that call fails for any reason other
    /// than outright rejection, the session is still created with
    /// `subject_id` absent - project listing then returns unfiltered
    /// results. Application tokens carry no principal and skip the
    /// lookup entirely.
    pub async fn authenticate_with_token(
        &self,
        host: &str,
        token: &str,
        kind: CredentialKind,
        subject_id: Option<i64>,
    ) -> Result<String> {
        Self::require_nonempty(host, "host")?;
        Self::require_nonempty(token, "token")?;

        let credential = Credential::new(kind, token.to_string());
        let subject_id = match (kind, subject_id) {
            (CredentialKind::Bearer, None) => match self.api.me(host, &credential).await {
                Ok(user) => Some(user.id),
                Err(e @ BridgeError::InvalidToken { .. }) => return Err(e),
                Err(e) => {
                    warn!(host, error = %e, "could not resolve subject id, continuing without it");
                    None
                }
            },
            (_, subject_id) => subject_id,
        };

        // Application tokens do not expire; bearer sessions get the
        // configured lifetime.
        let ttl = match kind {
            CredentialKind::Bearer => Some(self.session_ttl),
            CredentialKind::Application => None,
        };
        let session = Session::new(host.to_string(), credential, subject_id, ttl);
        let handle = session.handle.clone();
        self.store.put(session);
        info!(host, kind = %kind, "token login succeeded");
        Ok(handle)
    }

    /// Rebuild a session from a token cached in the vault.
    ///
    /// The cached token may have been revoked since it was saved, so a
    /// who-am-I call verifies it is still accepted before a session is
    /// registered.
    pub async fn authenticate_from_cache(&self, host: &str, identifier: &str) -> Result<String> {
        Self::require_nonempty(host, "host")?;
        Self::require_nonempty(identifier, "identifier")?;

        let cached = self.vault.load(host, identifier)?;
        let credential = Credential::new(cached.kind, cached.token);

        let subject_id = match self.api.me(host, &credential).await {
            Ok(user) => Some(user.id),
            Err(e @ BridgeError::InvalidToken { .. }) => return Err(e),
            Err(e) if matches!(e, BridgeError::RemoteUnavailable { .. }) => return Err(e),
            Err(e) => {
                warn!(host, identifier, error = %e, "liveness check inconclusive, continuing");
                cached.subject_id
            }
        };

        let ttl = match cached.kind {
            CredentialKind::Bearer => Some(self.session_ttl),
            CredentialKind::Application => None,
        };
        let session = Session::new(host.to_string(), credential, subject_id, ttl);
        let handle = session.handle.clone();
        self.store.put(session);
        info!(host, identifier, "cache login succeeded");
        Ok(handle)
    }

    /// Tear down a session. Idempotent; never fails for unknown handles.
    pub fn logout(&self, handle: &str) -> LogoutOutcome {
        if self.store.remove(handle) {
            LogoutOutcome::LoggedOut
        } else {
            LogoutOutcome::AlreadyGone
        }
    }

    /// Inspect a session without touching it.
    pub fn status(&self, handle: &str) -> SessionStatus {
        let session = match self.store.get(handle) {
            Ok(session) => session,
            Err(_) => return SessionStatus::missing(),
        };
        let now = Utc::now();
        SessionStatus {
            exists: true,
            live: !session.is_expired(now),
            remaining_ttl_seconds: session.remaining_ttl(now).map(|d| d.as_secs()),
            host: Some(session.host),
            subject_id: session.subject_id,
        }
    }

    /// Diagnostic check for monitoring: is the session live and does the
    /// remote still answer for its credential? Never fails - the report
    /// carries the failure detail instead.
    pub async fn health_check(&self, handle: &str) -> HealthReport {
        let session = match self.store.get(handle) {
            Ok(session) => session,
            Err(_) => {
                return HealthReport {
                    status: "unhealthy",
                    session_active: false,
                    api_accessible: false,
                    host: None,
                    subject_id: None,
                    details: "session not found or expired".to_string(),
                }
            }
        };

        match self.api.me(&session.host, &session.credential).await {
            Ok(_) => HealthReport {
                status: "healthy",
                session_active: true,
                api_accessible: true,
                host: Some(session.host),
                subject_id: session.subject_id,
                details: "all systems operational".to_string(),
            },
            Err(e) => HealthReport {
                status: "unhealthy",
                session_active: true,
                api_accessible: false,
                host: Some(session.host),
                subject_id: session.subject_id,
                details: format!("api not accessible: {e}"),
            },
        }
    }

    /// Attempt a silent refresh when a bearer session is inside its
    /// refresh margin. Fail-open: a failed refresh leaves the old
    /// credential in place and the next use fails naturally.
    pub async fn refresh_if_needed(&self, handle: &str) -> Result<()> {
        let session = self.store.get(handle)?;
        if !session.needs_refresh(Utc::now(), self.refresh_margin) {
            return Ok(());
        }
        let refresh_token = match session.credential.refresh_token() {
            Some(token) => token.to_string(),
            None => return Ok(()),
        };

        match self.api.refresh(&session.host, &refresh_token).await {
            Ok((auth_token, refresh)) => {
                let credential =
                    Credential::with_refresh(CredentialKind::Bearer, auth_token, refresh);
                // The session may have been swept while the call was in
                // flight; that is not an error for a best-effort refresh.
                if self.store.renew(handle, credential, self.session_ttl).is_ok() {
                    info!(host = %session.host, "session credential refreshed");
                }
            }
            Err(e) => {
                warn!(host = %session.host, error = %e, "silent refresh failed, keeping current credential");
            }
        }
        Ok(())
    }

    /// Resolve a handle for a tool call: refresh if due, mark the
    /// session used, spend a rate limit token, and hand back the session
    /// by value.
    ///
    /// Checkout does not verify the credential remotely. A token revoked
    /// on the remote side keeps its session registered here, each use
    /// failing with the remote's rejection, until the caller logs out or
    /// the expiry sweep removes it.
    pub async fn checkout(&self, handle: &str) -> Result<Session> {
        self.refresh_if_needed(handle).await?;
        self.store.touch(handle)?;
        self.store.try_acquire(handle)?;
        self.store.get(handle)
    }

    /// Persist the live session's credential to the vault.
    pub async fn save_token(&self, handle: &str, identifier: &str) -> Result<CachedToken> {
        Self::require_nonempty(identifier, "identifier")?;
        let session = self.store.get(handle)?;
        let record = CachedToken {
            host: session.host.clone(),
            identifier: identifier.to_string(),
            token: session.credential.token().to_string(),
            kind: session.credential.kind,
            subject_id: session.subject_id,
            cached_at: Utc::now(),
        };
        self.vault.save(&record).await?;
        Ok(record)
    }

    pub async fn delete_token(&self, host: &str, identifier: &str) -> Result<bool> {
        self.vault.delete(host, identifier).await
    }

    pub fn list_tokens(&self) -> Result<Vec<super::vault::TokenMetadata>> {
        self.vault.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::TokenBucket;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Authenticator, Arc<SessionStore>) {
        let dir = TempDir::new().expect("tempdir");
        let config = Config::default();
        let store = Arc::new(SessionStore::new(TokenBucket::new(
            config.rate_limit_capacity,
        )));
        let vault = Arc::new(Vault::new(dir.path().join("tokens")));
        let api = ApiClient::new(&config).expect("client");
        let auth = Authenticator::new(api, Arc::clone(&store), vault, &config);
        (dir, auth, store)
    }

    fn insert_application_session(store: &SessionStore, host: &str) -> String {
        let session = Session::new(
            host.to_string(),
            Credential::new(CredentialKind::Application, "tok_abc".to_string()),
            None,
            None,
        );
        let handle = session.handle.clone();
        store.put(session);
        handle
    }

    #[tokio::test]
    async fn empty_inputs_are_rejected_before_any_network_call() {
        let (_dir, auth, _store) = fixture();

        let result = auth
            .authenticate_with_credentials("", "user", "pass")
            .await;
        assert!(matches!(result, Err(BridgeError::Validation(_))));

        let result = auth
            .authenticate_with_credentials("https://taiga.example", "  ", "pass")
            .await;
        assert!(matches!(result, Err(BridgeError::Validation(_))));

        let result = auth
            .authenticate_with_token("https://taiga.example", "", CredentialKind::Bearer, None)
            .await;
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }

    #[tokio::test]
    async fn logout_is_idempotent_with_distinct_outcomes() {
        let (_dir, auth, store) = fixture();
        let handle = insert_application_session(&store, "https://taiga.example");

        assert_eq!(auth.logout(&handle), LogoutOutcome::LoggedOut);
        assert_eq!(auth.logout(&handle), LogoutOutcome::AlreadyGone);
        assert_eq!(auth.logout("never-existed"), LogoutOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn status_reports_missing_sessions() {
        let (_dir, auth, _store) = fixture();
        let status = auth.status("unknown-handle");
        assert!(!status.exists);
        assert!(!status.live);
        assert!(status.host.is_none());
    }

    #[tokio::test]
    async fn status_reports_live_application_session() {
        let (_dir, auth, store) = fixture();
        let handle = insert_application_session(&store, "https://example.test");

        let status = auth.status(&handle);
        assert!(status.exists);
        assert!(status.live);
        assert_eq!(status.host.as_deref(), Some("https://example.test"));
        assert_eq!(status.subject_id, None);
        assert_eq!(status.remaining_ttl_seconds, None);
    }

    #[tokio::test]
    async fn status_ttl_tracks_configured_expiry() {
        let (_dir, auth, store) = fixture();
        let session = Session::new(
            "https://taiga.example".to_string(),
            Credential::new(CredentialKind::Bearer, "tok".to_string()),
            Some(9),
            Some(Duration::from_secs(28_800)),
        );
        let handle = session.handle.clone();
        store.put(session);

        let status = auth.status(&handle);
        let ttl = status.remaining_ttl_seconds.expect("bearer has a ttl");
        assert!(ttl > 28_700 && ttl <= 28_800);
    }

    #[tokio::test]
    async fn save_then_delete_then_load_is_not_found() {
        let (_dir, auth, store) = fixture();
        let handle = insert_application_session(&store, "https://example.test");

        let record = auth.save_token(&handle, "ci").await.unwrap();
        assert_eq!(record.host, "https://example.test");
        assert_eq!(record.kind, CredentialKind::Application);

        assert!(auth.delete_token("https://example.test", "ci").await.unwrap());
        assert!(matches!(
            auth.authenticate_from_cache("https://example.test", "ci")
                .await,
            Err(BridgeError::TokenNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn save_token_requires_live_session() {
        let (_dir, auth, _store) = fixture();
        assert!(matches!(
            auth.save_token("gone", "ci").await,
            Err(BridgeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn listed_tokens_expose_metadata_only() {
        let (_dir, auth, store) = fixture();
        let handle = insert_application_session(&store, "https://example.test");
        auth.save_token(&handle, "ci").await.unwrap();

        let listed = auth.list_tokens().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identifier, "ci");
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("tok_abc"));
    }

    #[tokio::test]
    async fn refresh_is_a_no_op_far_from_expiry() {
        let (_dir, auth, store) = fixture();
        let session = Session::new(
            "https://taiga.example".to_string(),
            Credential::with_refresh(
                CredentialKind::Bearer,
                "tok".to_string(),
                Some("refresh".to_string()),
            ),
            Some(9),
            Some(Duration::from_secs(28_800)),
        );
        let handle = session.handle.clone();
        store.put(session);

        // Fresh session: no refresh attempted, no network touched.
        auth.refresh_if_needed(&handle).await.unwrap();
        assert_eq!(store.get(&handle).unwrap().credential.token(), "tok");
    }

    #[tokio::test]
    async fn checkout_enforces_session_existence() {
        let (_dir, auth, _store) = fixture();
        assert!(matches!(
            auth.checkout("unknown").await,
            Err(BridgeError::SessionNotFound(_))
        ));
    }

    mod mock_remote {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn failed_identity_lookup_degrades_to_anonymous_subject() {
            let server = MockServer::start().await;
            // A permanent non-auth failure: the login still succeeds, the
            // session just carries no subject id.
            Mock::given(method("GET"))
                .and(path("/api/v1/users/me"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;

            let (_dir, auth, store) = fixture();
            let handle = auth
                .authenticate_with_token(&server.uri(), "tok_abc", CredentialKind::Bearer, None)
                .await
                .unwrap();
            assert_eq!(store.get(&handle).unwrap().subject_id, None);
        }

        #[tokio::test]
        async fn rejected_bearer_token_fails_the_login() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/users/me"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;

            let (_dir, auth, store) = fixture();
            let result = auth
                .authenticate_with_token(&server.uri(), "tok_abc", CredentialKind::Bearer, None)
                .await;
            assert!(matches!(result, Err(BridgeError::InvalidToken { .. })));
            assert!(store.is_empty());
        }

        #[tokio::test]
        async fn cache_login_verifies_the_token_is_still_accepted() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/users/me"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;

            let (_dir, auth, store) = fixture();
            let handle = insert_application_session(&store, &server.uri());
            auth.save_token(&handle, "ci").await.unwrap();
            auth.logout(&handle);

            // Token revoked remotely since it was cached.
            let result = auth.authenticate_from_cache(&server.uri(), "ci").await;
            assert!(matches!(result, Err(BridgeError::InvalidToken { .. })));
        }

        #[tokio::test]
        async fn cache_login_resolves_the_subject_when_live() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/users/me"))
                .respond_with(ResponseTemplate::new(200).set_body_json(
                    serde_json::json!({"id": 7, "username": "alice"}),
                ))
                .mount(&server)
                .await;

            let (_dir, auth, store) = fixture();
            let handle = insert_application_session(&store, &server.uri());
            auth.save_token(&handle, "ci").await.unwrap();
            auth.logout(&handle);

            let restored = auth
                .authenticate_from_cache(&server.uri(), "ci")
                .await
                .unwrap();
            assert_eq!(store.get(&restored).unwrap().subject_id, Some(7));
        }
    }
}
