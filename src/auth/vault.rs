//! Durable, permission-restricted token cache.
//!
//! One JSON file per (host, identifier) under the per-user cache
//! directory. Writes go to a temporary file created with owner-only
//! permissions and are renamed over the target, so a reader never sees a
//! partial file and a crash mid-write leaves the previous token intact.
//!
//! A cached token outlives any in-memory session: the sweep never touches
//! the vault, and a swept session can be rebuilt from here. The token may
//! of course have been revoked remotely in the meantime, which is why
//! loading into a session performs a liveness check.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

use super::session::CredentialKind;

/// On-disk schema. The single supported version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub host: String,
    pub identifier: String,
    pub token: String,
    pub kind: CredentialKind,
    pub subject_id: Option<i64>,
    pub cached_at: DateTime<Utc>,
}

/// What `list` exposes: everything except the token value.
#[derive(Debug, Clone, Serialize)]
pub struct TokenMetadata {
    pub host: String,
    pub identifier: String,
    pub kind: CredentialKind,
    pub subject_id: Option<i64>,
    pub cached_at: DateTime<Utc>,
}

pub struct Vault {
    dir: PathBuf,
    // Serializes concurrent saves to the same file so two
    // temp-then-rename sequences cannot interleave.
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Vault {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace `://`, `/`, `:` and anything else unsafe with underscores
    /// so a host URL or caller-chosen identifier becomes a valid file
    /// name component.
    fn sanitize(part: &str) -> String {
        part.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn token_path(&self, host: &str, identifier: &str) -> PathBuf {
        self.dir.join(format!(
            "token_{}_{}.json",
            Self::sanitize(host),
            Self::sanitize(identifier)
        ))
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("vault lock table poisoned");
        Arc::clone(
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Persist a token, atomically replacing any previous record for the
    /// same (host, identifier).
    pub async fn save(&self, record: &CachedToken) -> Result<()> {
        let path = self.token_path(&record.host, &record.identifier);
        let lock = self.path_lock(&path);
        let guard = lock.lock().await;

        let contents = serde_json::to_string_pretty(record)
            .map_err(|e| BridgeError::InvalidResponse(format!("token serialization: {e}")))?;

        // Filesystem work runs off the async workers; the per-path lock is
        // held across it so temp-then-rename sequences cannot interleave.
        let dir = self.dir.clone();
        let target = path.clone();
        run_blocking(move || {
            ensure_dir(&dir)?;
            let tmp = target.with_extension("json.tmp");
            write_owner_only(&tmp, &contents)?;
            if let Err(e) = fs::rename(&tmp, &target) {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
            Ok(())
        })
        .await?;

        drop(guard);
        drop(lock);
        self.prune_locks();

        info!(host = %record.host, identifier = %record.identifier, "token cached");
        Ok(())
    }

    /// Load a cached token. `TokenNotFound` when no file exists,
    /// `Corrupt` when it cannot be parsed - the offending file is left in
    /// place for the operator, never deleted here.
    pub fn load(&self, host: &str, identifier: &str) -> Result<CachedToken> {
        let path = self.token_path(host, identifier);
        if !path.exists() {
            return Err(BridgeError::TokenNotFound {
                host: host.to_string(),
                identifier: identifier.to_string(),
            });
        }

        warn_if_insecure(&path);

        let contents = fs::read_to_string(&path)?;
        let record: CachedToken =
            serde_json::from_str(&contents).map_err(|source| BridgeError::Corrupt {
                path: path.clone(),
                source,
            })?;
        debug!(host, identifier, "token loaded from cache");
        Ok(record)
    }

    /// Delete a cached token. Idempotent: succeeds whether or not the
    /// file existed, and reports which.
    pub async fn delete(&self, host: &str, identifier: &str) -> Result<bool> {
        let path = self.token_path(host, identifier);
        let lock = self.path_lock(&path);
        let guard = lock.lock().await;

        let removed = run_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await?;

        drop(guard);
        drop(lock);
        self.prune_locks();

        if removed {
            info!(host, identifier, "cached token deleted");
        }
        Ok(removed)
    }

    /// Enumerate cached tokens. Unreadable or corrupt files are skipped
    /// with a warning; the token value itself is never included.
    pub fn list(&self) -> Result<Vec<TokenMetadata>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tokens = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !name.starts_with("token_") || !name.ends_with(".json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(BridgeError::from)
                .and_then(|c| {
                    serde_json::from_str::<CachedToken>(&c).map_err(|source| BridgeError::Corrupt {
                        path: path.clone(),
                        source,
                    })
                }) {
                Ok(record) => tokens.push(TokenMetadata {
                    host: record.host,
                    identifier: record.identifier,
                    kind: record.kind,
                    subject_id: record.subject_id,
                    cached_at: record.cached_at,
                }),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable cache file"),
            }
        }
        tokens.sort_by(|a, b| a.host.cmp(&b.host).then(a.identifier.cmp(&b.identifier)));
        Ok(tokens)
    }

    /// Drop lock entries nobody holds anymore so the map does not grow
    /// with every (host, identifier) ever touched.
    fn prune_locks(&self) {
        self.locks
            .lock()
            .expect("vault lock table poisoned")
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::Io(std::io::Error::other(e)))?
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write `contents` to `path` with owner-only permission bits set before
/// any data is visible. Fails loudly if the filesystem cannot enforce
/// 0600 rather than silently degrading.
#[cfg(unix)]
fn write_owner_only(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::fs::PermissionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;

    let mode = file.metadata()?.permissions().mode();
    if mode & 0o077 != 0 {
        let _ = fs::remove_file(path);
        return Err(BridgeError::Io(std::io::Error::other(format!(
            "filesystem did not honor owner-only permissions on {} (mode {:o})",
            path.display(),
            mode
        ))));
    }
    Ok(())
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, _contents: &str) -> Result<()> {
    Err(BridgeError::Io(std::io::Error::other(format!(
        "cannot enforce owner-only permissions for {} on this platform",
        path.display()
    ))))
}

#[cfg(unix)]
fn warn_if_insecure(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(file = %path.display(), mode = format!("{mode:o}"), "token file has insecure permissions");
        }
    }
}

#[cfg(not(unix))]
fn warn_if_insecure(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault() -> (TempDir, Vault) {
        let dir = TempDir::new().expect("tempdir");
        let vault = Vault::new(dir.path().join("taiga-bridge"));
        (dir, vault)
    }

    fn record(host: &str, identifier: &str) -> CachedToken {
        CachedToken {
            host: host.to_string(),
            identifier: identifier.to_string(),
            token: "tok_secret_abc".to_string(),
            kind: CredentialKind::Application,
            subject_id: Some(7),
            cached_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let (_dir, vault) = vault();
        let saved = record("https://taiga.example", "ci");
        vault.save(&saved).await.unwrap();

        let loaded = vault.load("https://taiga.example", "ci").unwrap();
        assert_eq!(loaded.host, saved.host);
        assert_eq!(loaded.identifier, saved.identifier);
        assert_eq!(loaded.token, saved.token);
        assert_eq!(loaded.kind, saved.kind);
        assert_eq!(loaded.subject_id, Some(7));
    }

    #[tokio::test]
    async fn missing_token_is_not_found() {
        let (_dir, vault) = vault();
        assert!(matches!(
            vault.load("https://taiga.example", "ci"),
            Err(BridgeError::TokenNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn save_replaces_previous_record() {
        let (_dir, vault) = vault();
        let mut first = record("https://taiga.example", "ci");
        vault.save(&first).await.unwrap();
        first.token = "tok_replacement".to_string();
        vault.save(&first).await.unwrap();

        let loaded = vault.load("https://taiga.example", "ci").unwrap();
        assert_eq!(loaded.token, "tok_replacement");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, vault) = vault();
        vault.save(&record("https://taiga.example", "ci")).await.unwrap();

        assert!(vault.delete("https://taiga.example", "ci").await.unwrap());
        assert!(!vault.delete("https://taiga.example", "ci").await.unwrap());
        assert!(matches!(
            vault.load("https://taiga.example", "ci"),
            Err(BridgeError::TokenNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_omits_token_values() {
        let (_dir, vault) = vault();
        vault.save(&record("https://taiga.example", "ci")).await.unwrap();
        vault.save(&record("https://other.example", "dev")).await.unwrap();

        let listed = vault.list().unwrap();
        assert_eq!(listed.len(), 2);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("tok_secret_abc"));
        assert!(json.contains("https://taiga.example"));
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_and_preserved() {
        let (_dir, vault) = vault();
        vault.save(&record("https://taiga.example", "ci")).await.unwrap();
        let path = vault.token_path("https://taiga.example", "ci");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            vault.load("https://taiga.example", "ci"),
            Err(BridgeError::Corrupt { .. })
        ));
        // Corruption requires operator cleanup, never silent deletion.
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, vault) = vault();
        vault.save(&record("https://taiga.example", "ci")).await.unwrap();
        let path = vault.token_path("https://taiga.example", "ci");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn lock_table_is_pruned_after_use() {
        let (_dir, vault) = vault();
        vault.save(&record("https://taiga.example", "ci")).await.unwrap();
        vault.save(&record("https://other.example", "dev")).await.unwrap();
        vault.delete("https://taiga.example", "ci").await.unwrap();

        // No save or delete in flight, so no per-path lock should remain.
        assert_eq!(vault.locks.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn hosts_with_same_sanitized_form_share_a_file() {
        // "/" and ":" both sanitize to "_", so these collide by design;
        // the identifier is what distinguishes environments.
        let (_dir, vault) = vault();
        let a = vault.token_path("https://taiga.example", "ci");
        let b = vault.token_path("https:__taiga.example", "ci");
        assert_eq!(a, b);

        let c = vault.token_path("https://taiga.example", "dev");
        assert_ne!(a, c);
    }
}
