//! Account pool operator CLI
//!
//! Single binary over the account store that:
//! 1. Loads configuration (file, env overrides, defaults)
//! 2. Opens the store, running schema migrations
//! 3. Runs one administrative subcommand against the pool
//! 4. Closes the store and exits

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use account_auth::SessionAuthenticator;
use account_pool::{AccountInfo, LineFormat, Pool};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "account-pool", about = "Manage the pooled account store", version)]
struct Cli {
    /// Config file (default: ACCOUNT_POOL_CONFIG, then ./account-pool.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, PartialEq, Subcommand)]
enum Command {
    /// List accounts with login state and usage
    Accounts,

    /// Show pool totals and per-queue lock counts
    Stats,

    /// Import accounts from a delimited file
    AddAccounts {
        file: PathBuf,
        /// Column template, e.g. "username:password:email:email_password:_:cookies"
        line_format: String,
    },

    /// Delete accounts by username
    DelAccounts {
        #[arg(required = true)]
        usernames: Vec<String>,
    },

    /// Delete every inactive account
    DelInactive,

    /// Log in the given accounts, or every fresh inactive account
    LoginAccounts { usernames: Vec<String> },

    /// Reset the given accounts and log them in again
    Relogin {
        #[arg(required = true)]
        usernames: Vec<String>,
    },

    /// Relogin every account deactivated by an error
    ReloginFailed,

    /// Clear all queue locks
    ResetLocks,

    /// Set an account's active flag
    SetActive {
        username: String,
        #[arg(action = ArgAction::Set)]
        active: bool,
    },

    /// Deactivate an account, recording why
    MarkInactive { username: String, reason: String },

    /// Check out an account for a queue
    Checkout {
        queue: String,
        /// Poll until an account frees up
        #[arg(long)]
        wait: bool,
    },

    /// Release an account's lock for a queue
    Unlock {
        username: String,
        queue: String,
        #[arg(long, default_value_t = 0)]
        req_count: u64,
    },

    /// Show when the next account frees up for a queue
    NextAvailable { queue: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    run(cli).await
}

/// LOG_LEVEL, then RUST_LOG, then `info`. Logs go to stderr so command
/// output on stdout stays machine-readable.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let explicit = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(explicit.as_deref()).with_context(|| match &explicit {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load default config".to_owned(),
    })?;

    info!(
        db = %config.store.path.display(),
        lock_minutes = config.pool.lock_minutes,
        verify = config.auth.verify_url.is_some(),
        "configuration loaded"
    );

    let authenticator = SessionAuthenticator::new(config.auth_config())
        .context("failed to build session authenticator")?;
    let pool = Pool::open(
        &config.store.path,
        config.store_options(),
        Arc::new(authenticator),
        config.pool_settings(),
    )
    .await
    .with_context(|| format!("failed to open account store {}", config.store.path.display()))?;

    let result = execute(&pool, cli.command).await;
    pool.close().await;
    result
}

async fn execute(pool: &Pool, command: Command) -> Result<()> {
    match command {
        Command::Accounts => {
            let info = pool.accounts_info().await?;
            print!("{}", render_accounts(&info));
        }
        Command::Stats => print_json(&pool.stats().await?)?,
        Command::AddAccounts { file, line_format } => {
            let format = LineFormat::parse(&line_format)
                .with_context(|| format!("invalid line format {line_format:?}"))?;
            let report = pool
                .import_file(&file, &format)
                .await
                .with_context(|| format!("failed to import {}", file.display()))?;
            print_json(&report)?;
        }
        Command::DelAccounts { usernames } => {
            let deleted = pool.delete_accounts(&usernames).await?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
        Command::DelInactive => {
            let deleted = pool.delete_inactive().await?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
        Command::LoginAccounts { usernames } => {
            let only = (!usernames.is_empty()).then_some(usernames.as_slice());
            print_json(&pool.login_all(only).await?)?;
        }
        Command::Relogin { usernames } => print_json(&pool.relogin(&usernames).await?)?,
        Command::ReloginFailed => print_json(&pool.relogin_failed().await?)?,
        Command::ResetLocks => {
            let accounts = pool.reset_locks().await?;
            print_json(&serde_json::json!({ "accounts": accounts }))?;
        }
        Command::SetActive { username, active } => {
            if !pool.set_active(&username, active).await? {
                anyhow::bail!("account not found: {username}");
            }
        }
        Command::MarkInactive { username, reason } => {
            if !pool.mark_inactive(&username, &reason).await? {
                anyhow::bail!("account not found: {username}");
            }
        }
        Command::Checkout { queue, wait } => {
            let account = if wait {
                pool.get_for_queue_or_wait(&queue).await?
            } else {
                pool.get_for_queue(&queue).await?
            };
            let checkout = account.map(|account| Checkout {
                locked_until: account.locks.get(&queue).map(|until| until.to_rfc3339()),
                username: account.username,
                queue: queue.clone(),
            });
            print_json(&checkout)?;
        }
        Command::Unlock {
            username,
            queue,
            req_count,
        } => {
            if !pool.unlock(&username, &queue, req_count).await? {
                anyhow::bail!("account not found: {username}");
            }
        }
        Command::NextAvailable { queue } => {
            let next = pool.next_available_at(&queue).await?;
            print_json(&serde_json::json!({
                "queue": queue,
                "next_available": next.map(|n| n.to_string()),
            }))?;
        }
    }
    Ok(())
}

/// What `checkout` prints; credentials never leave the store.
#[derive(Debug, Serialize)]
struct Checkout {
    username: String,
    queue: String,
    locked_until: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Fixed-width table for `accounts`.
fn render_accounts(items: &[AccountInfo]) -> String {
    let mut rows = vec![[
        "username".to_owned(),
        "logged_in".to_owned(),
        "active".to_owned(),
        "last_used".to_owned(),
        "total_req".to_owned(),
        "error_msg".to_owned(),
    ]];
    for item in items {
        rows.push([
            item.username.clone(),
            item.logged_in.to_string(),
            item.active.to_string(),
            item.last_used
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_owned()),
            item.total_req.to_string(),
            item.error_msg.clone().unwrap_or_else(|| "-".to_owned()),
        ]);
    }

    let mut widths = [0usize; 6];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
