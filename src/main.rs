//! taiga-bridge - an MCP server in front of the Taiga REST API.
//!
//! The bridge turns a username/password or token into an opaque,
//! time-bounded, rate-limited session handle, caches long-lived tokens
//! on disk, and exposes Taiga's project-management resources as MCP
//! tools. stdout carries the MCP protocol; every log line goes to
//! stderr (and optionally a file).

mod api;
mod auth;
mod cli;
mod config;
mod error;
mod limiter;
mod retry;
mod server;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api::ApiClient;
use auth::{Authenticator, SessionStore, Vault};
use cli::{Cli, Command};
use config::Config;
use limiter::TokenBucket;

/// Initialize the tracing subscriber. Returns the appender guard that
/// must stay alive for file logging to flush.
fn init_tracing(log_file: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path.file_name().map(Path::new).unwrap_or_else(|| Path::new("taiga-bridge.log"));
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .init();
            None
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let store = Arc::new(SessionStore::new(TokenBucket::new(
        config.rate_limit_capacity,
    )));
    store.spawn_sweeper(config.sweep_interval());

    let vault = Arc::new(Vault::new(Config::cache_dir()?));
    let api = ApiClient::new(&config)?;
    let auth = Arc::new(Authenticator::new(
        api,
        Arc::clone(&store),
        vault,
        &config,
    ));

    info!(
        session_expiry_s = config.session_expiry_seconds,
        rate_limit = config.rate_limit_capacity,
        "bridge starting"
    );
    let result = server::run_stdio(auth).await;
    store.shutdown();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; ignore when missing.
    let _ = dotenvy::dotenv();

    let args = Cli::parse();
    let _guard = init_tracing(args.log_file.as_deref());

    let config = Config::load()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Login {
            host,
            username,
            token,
            token_type,
            identifier,
        } => cli::handle_login(&config, host, username, token, token_type, identifier).await,
        Command::Logout { host, identifier } => cli::handle_logout(host, identifier).await,
        Command::Tokens => cli::handle_tokens(),
    }
}
