//! Command-line interface.
//!
//! `serve` (the default) speaks MCP over stdio. The `login`, `logout`
//! and `tokens` subcommands manage the on-disk token cache directly, so
//! an operator can authenticate once and keep passwords out of MCP
//! client configs entirely.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::api::ApiClient;
use crate::auth::{CachedToken, CredentialKind, Vault};
use crate::config::Config;

#[derive(Parser)]
#[command(
    name = "taiga-bridge",
    version,
    about = "MCP bridge for the Taiga project-management API"
)]
pub struct Cli {
    /// Append logs to this file in addition to stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the MCP server on stdio (the default)
    Serve,
    /// Authenticate against a Taiga instance and cache the token
    Login {
        /// Base URL of the Taiga instance, e.g. https://tree.taiga.io
        #[arg(long)]
        host: String,
        /// Username for password login; omit when using --token
        #[arg(long)]
        username: Option<String>,
        /// Use an existing token instead of a password login
        #[arg(long)]
        token: Option<String>,
        /// Token kind when --token is given
        #[arg(long, default_value = "Application")]
        token_type: String,
        /// Cache label, allowing several tokens per host
        #[arg(long, default_value = "default")]
        identifier: String,
    },
    /// Remove a cached token
    Logout {
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "default")]
        identifier: String,
    },
    /// List cached tokens (never prints token values)
    Tokens,
}

fn open_vault() -> Result<Vault> {
    Ok(Vault::new(Config::cache_dir()?))
}

pub async fn handle_login(
    config: &Config,
    host: String,
    username: Option<String>,
    token: Option<String>,
    token_type: String,
    identifier: String,
) -> Result<()> {
    let vault = open_vault()?;

    let record = match (token, username) {
        (Some(token), _) => {
            let kind = CredentialKind::parse(&token_type)
                .with_context(|| format!("unknown token type '{token_type}'"))?;
            CachedToken {
                host: host.clone(),
                identifier: identifier.clone(),
                token,
                kind,
                subject_id: None,
                cached_at: Utc::now(),
            }
        }
        (None, Some(username)) => {
            let password = read_password(&username)?;
            let api = ApiClient::new(config)?;
            let response = api.login(&host, &username, &password).await?;
            CachedToken {
                host: host.clone(),
                identifier: identifier.clone(),
                token: response.auth_token,
                kind: CredentialKind::Bearer,
                subject_id: response.id,
                cached_at: Utc::now(),
            }
        }
        (None, None) => bail!("either --username or --token is required"),
    };

    vault.save(&record).await?;
    println!("Token cached for {host} ({identifier})");
    Ok(())
}

pub async fn handle_logout(host: String, identifier: String) -> Result<()> {
    let vault = open_vault()?;
    if vault.delete(&host, &identifier).await? {
        println!("Cached token removed for {host} ({identifier})");
    } else {
        println!("No cached token for {host} ({identifier})");
    }
    Ok(())
}

pub fn handle_tokens() -> Result<()> {
    let vault = open_vault()?;
    let tokens = vault.list()?;
    if tokens.is_empty() {
        println!("No cached tokens");
        return Ok(());
    }
    for token in tokens {
        println!(
            "{:40} {:12} {:12} cached {}",
            token.host,
            token.identifier,
            token.kind.to_string(),
            token.cached_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}

/// Prompt on the terminal. Password comes from TAIGA_PASSWORD when set
/// so CI can log in non-interactively.
fn read_password(username: &str) -> Result<String> {
    if let Ok(password) = std::env::var("TAIGA_PASSWORD") {
        return Ok(password);
    }
    eprint!("Password for {username}: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(password)
}
