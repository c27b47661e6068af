//! HTTP client for a Taiga instance.
//!
//! One [`ApiClient`] is shared by every session: `reqwest::Client` is
//! cheap to clone and pools connections internally, and the credential is
//! passed per call rather than stored, since a single bridge process
//! serves sessions against several hosts at once.

use std::time::Duration;

use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::session::Credential;
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::retry::{retry, RetryPolicy};

/// Successful response from `POST /api/v1/auth`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub auth_token: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Successful response from `GET /api/v1/users/me`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: Option<String>,
}

/// Response from `POST /api/v1/auth/refresh`.
#[derive(Debug, Clone, Deserialize)]
struct RefreshResponse {
    auth_token: String,
    #[serde(default)]
    refresh: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            policy: RetryPolicy::from_config(config),
        })
    }

    fn api_url(host: &str, path: &str) -> String {
        format!("{}/api/v1/{}", host.trim_end_matches('/'), path)
    }

    /// Core request path: build, send, classify. Rebuilt fresh on every
    /// retry attempt so the body and headers are never reused after a
    /// partial send.
    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        credential: Option<&Credential>,
        body: Option<&Value>,
    ) -> Result<T> {
        let mut request = self.client.request(method, url);
        if let Some(credential) = credential {
            request = request.header(header::AUTHORIZATION, credential.authorization_value());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return serde_json::from_value(Value::Null)
                    .map_err(|e| BridgeError::InvalidResponse(e.to_string()));
            }
            return response
                .json::<T>()
                .await
                .map_err(|e| BridgeError::InvalidResponse(format!("{url}: {e}")));
        }

        let retry_after = parse_retry_after(response.headers().get(header::RETRY_AFTER));
        let host = url.split("/api/").next().unwrap_or(url).to_string();
        let text = response.text().await.unwrap_or_default();
        Err(BridgeError::from_status(status, &host, &text, retry_after))
    }

    /// Send under the retry policy. `op` labels log lines only.
    async fn request_json<T: DeserializeOwned>(
        &self,
        op: &str,
        method: Method,
        url: &str,
        credential: Option<&Credential>,
        body: Option<&Value>,
    ) -> Result<T> {
        debug!(op, url, "outbound request");
        retry(&self.policy, op, || {
            self.send_once(method.clone(), url, credential, body)
        })
        .await
    }

    // ===== Authentication endpoints =====

    /// Exchange username/password for a bearer token.
    pub async fn login(&self, host: &str, username: &str, password: &str) -> Result<LoginResponse> {
        let url = Self::api_url(host, "auth");
        let body = json!({
            "type": "normal",
            "username": username,
            "password": password,
        });
        self.request_json("login", Method::POST, &url, None, Some(&body))
            .await
            .map_err(|e| match e {
                // A rejected password login is invalid credentials, not a
                // revoked session token.
                BridgeError::InvalidToken { host } => BridgeError::InvalidCredentials { host },
                other => other,
            })
    }

    /// Resolve the identity behind a credential.
    pub async fn me(&self, host: &str, credential: &Credential) -> Result<UserInfo> {
        let url = Self::api_url(host, "users/me");
        self.request_json("users_me", Method::GET, &url, Some(credential), None)
            .await
    }

    /// Exchange a refresh secret for a new bearer token pair.
    pub async fn refresh(&self, host: &str, refresh_token: &str) -> Result<(String, Option<String>)> {
        let url = Self::api_url(host, "auth/refresh");
        let body = json!({ "refresh": refresh_token });
        let response: RefreshResponse = self
            .request_json("auth_refresh", Method::POST, &url, None, Some(&body))
            .await?;
        Ok((response.auth_token, response.refresh))
    }

    // ===== Generic resource operations =====
    //
    // The CRUD surface is deliberately thin plumbing: responses flow back
    // to the MCP client as raw JSON. Writes carry the resource's current
    // `version` so the remote can detect concurrent edits; an HTTP 409
    // surfaces as `VersionConflict` and is never retried here.

    pub async fn list_resource(
        &self,
        host: &str,
        credential: &Credential,
        resource: &str,
        query: &[(&str, String)],
    ) -> Result<Value> {
        let mut url = Self::api_url(host, resource);
        if !query.is_empty() {
            let qs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
            url = format!("{url}?{}", qs.join("&"));
        }
        self.request_json(resource, Method::GET, &url, Some(credential), None)
            .await
    }

    pub async fn get_resource(
        &self,
        host: &str,
        credential: &Credential,
        resource: &str,
        id: i64,
    ) -> Result<Value> {
        let url = Self::api_url(host, &format!("{resource}/{id}"));
        self.request_json(resource, Method::GET, &url, Some(credential), None)
            .await
    }

    pub async fn create_resource(
        &self,
        host: &str,
        credential: &Credential,
        resource: &str,
        body: Value,
    ) -> Result<Value> {
        let url = Self::api_url(host, resource);
        self.request_json(resource, Method::POST, &url, Some(credential), Some(&body))
            .await
    }

    /// Partial update carrying the optimistic-concurrency `version` field.
    pub async fn update_resource(
        &self,
        host: &str,
        credential: &Credential,
        resource: &str,
        id: i64,
        version: i64,
        mut patch: Value,
    ) -> Result<Value> {
        let url = Self::api_url(host, &format!("{resource}/{id}"));
        match patch.as_object_mut() {
            Some(map) => {
                map.insert("version".to_string(), json!(version));
            }
            None => {
                return Err(BridgeError::Validation(
                    "update payload must be a JSON object".to_string(),
                ))
            }
        }
        self.request_json(resource, Method::PATCH, &url, Some(credential), Some(&patch))
            .await
    }

    pub async fn delete_resource(
        &self,
        host: &str,
        credential: &Credential,
        resource: &str,
        id: i64,
    ) -> Result<()> {
        let url = Self::api_url(host, &format!("{resource}/{id}"));
        let _: Value = self
            .request_json(resource, Method::DELETE, &url, Some(credential), None)
            .await?;
        Ok(())
    }

    /// List projects, filtered to the subject's memberships when an
    /// identity is known. Without one (the degraded application-token
    /// mode) the unfiltered listing is returned instead.
    pub async fn list_projects(
        &self,
        host: &str,
        credential: &Credential,
        member: Option<i64>,
    ) -> Result<Value> {
        let query: Vec<(&str, String)> = match member {
            Some(id) => vec![("member", id.to_string())],
            None => Vec::new(),
        };
        self.list_resource(host, credential, "projects", &query).await
    }
}

/// Parse a `Retry-After` header given in seconds. Dates are rare from
/// Taiga and are ignored in favor of the computed backoff.
fn parse_retry_after(value: Option<&header::HeaderValue>) -> Option<Duration> {
    let seconds: u64 = value?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}
