//! Configuration types and loading
//!
//! Precedence: CLI args > env vars > config file > defaults.
//! The bearer token comes from ACCOUNT_POOL_BEARER_TOKEN or bearer_token_file,
//! never from the TOML itself, to keep secrets out of config files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use account_auth::SessionAuthConfig;
use account_auth::constants::{
    DEFAULT_CSRF_COOKIE, DEFAULT_CSRF_HEADER, DEFAULT_REQUIRED_COOKIES,
    DEFAULT_VERIFY_TIMEOUT_SECS,
};
use account_pool::{AccountOrder, PoolSettings, StoreOptions};
use chrono::TimeDelta;
use common::Secret;
use serde::Deserialize;

/// Used when neither `--config` nor ACCOUNT_POOL_CONFIG is given.
pub const DEFAULT_CONFIG_PATH: &str = "account-pool.toml";

const ENV_CONFIG: &str = "ACCOUNT_POOL_CONFIG";
const ENV_DB: &str = "ACCOUNT_POOL_DB";
const ENV_RAISE: &str = "ACCOUNT_POOL_RAISE_WHEN_NO_ACCOUNT";
const ENV_BEARER: &str = "ACCOUNT_POOL_BEARER_TOKEN";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub pool: PoolConfig,
    pub auth: AuthConfig,
}

/// Account database settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub max_retries: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("accounts.db"),
            max_retries: account_pool::store::DEFAULT_MAX_RETRIES,
            busy_timeout_ms: account_pool::store::DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Checkout behaviour
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub lock_minutes: u32,
    pub poll_interval_secs: u64,
    pub raise_when_no_account: bool,
    pub order: AccountOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lock_minutes: account_pool::pool::DEFAULT_LOCK_MINUTES as u32,
            poll_interval_secs: account_pool::pool::DEFAULT_POLL_INTERVAL.as_secs(),
            raise_when_no_account: false,
            order: AccountOrder::default(),
        }
    }
}

/// Session authenticator settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub verify_url: Option<String>,
    #[serde(skip)]
    pub bearer_token: Option<Secret<String>>,
    /// Path to a file containing the bearer token (alternative to ACCOUNT_POOL_BEARER_TOKEN)
    pub bearer_token_file: Option<PathBuf>,
    pub csrf_cookie: String,
    pub csrf_header: String,
    pub required_cookies: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            verify_url: None,
            bearer_token: None,
            bearer_token_file: None,
            csrf_cookie: DEFAULT_CSRF_COOKIE.into(),
            csrf_header: DEFAULT_CSRF_HEADER.into(),
            required_cookies: DEFAULT_REQUIRED_COOKIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            timeout_secs: DEFAULT_VERIFY_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Load configuration, then overlay environment variables and validate.
    ///
    /// `explicit` is a path the operator asked for; it must exist. Without
    /// one, [`DEFAULT_CONFIG_PATH`] is read if present, else defaults apply.
    pub fn load(explicit: Option<&Path>) -> common::Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };

        config.apply_env()?;
        config.validate()?;
        config.resolve_bearer_token()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(path) = std::env::var(ENV_DB) {
            if !path.trim().is_empty() {
                self.store.path = PathBuf::from(path);
            }
        }
        if let Ok(value) = std::env::var(ENV_RAISE) {
            self.pool.raise_when_no_account = parse_bool(ENV_RAISE, &value)?;
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.store.max_retries == 0 {
            return Err(common::Error::Config(
                "store.max_retries must be greater than 0".into(),
            ));
        }
        if self.pool.lock_minutes == 0 {
            return Err(common::Error::Config(
                "pool.lock_minutes must be greater than 0".into(),
            ));
        }
        if self.pool.poll_interval_secs == 0 {
            return Err(common::Error::Config(
                "pool.poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.auth.timeout_secs == 0 {
            return Err(common::Error::Config(
                "auth.timeout_secs must be greater than 0".into(),
            ));
        }
        if let Some(url) = &self.auth.verify_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "auth.verify_url must start with http:// or https://, got: {url}"
                )));
            }
        }
        Ok(())
    }

    /// Env var takes precedence over the token file.
    fn resolve_bearer_token(&mut self) -> common::Result<()> {
        if let Ok(token) = std::env::var(ENV_BEARER) {
            if !token.trim().is_empty() {
                self.auth.bearer_token = Some(Secret::new(token.trim().to_owned()));
                return Ok(());
            }
        }
        if let Some(ref token_file) = self.auth.bearer_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read bearer_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                self.auth.bearer_token = Some(Secret::new(token));
            }
        }
        Ok(())
    }

    /// Config path the operator asked for: `--config`, then ACCOUNT_POOL_CONFIG.
    pub fn resolve_path(cli_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = cli_path {
            return Some(p.to_path_buf());
        }
        std::env::var(ENV_CONFIG)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_retries: self.store.max_retries,
            busy_timeout: Duration::from_millis(self.store.busy_timeout_ms),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            lock_duration: TimeDelta::minutes(i64::from(self.pool.lock_minutes)),
            poll_interval: Duration::from_secs(self.pool.poll_interval_secs),
            raise_when_no_account: self.pool.raise_when_no_account,
            order: self.pool.order,
        }
    }

    pub fn auth_config(&self) -> SessionAuthConfig {
        SessionAuthConfig {
            verify_url: self.auth.verify_url.clone(),
            bearer_token: self.auth.bearer_token.clone(),
            csrf_cookie: self.auth.csrf_cookie.clone(),
            csrf_header: self.auth.csrf_header.clone(),
            required_cookies: self.auth.required_cookies.clone(),
            timeout: Duration::from_secs(self.auth.timeout_secs),
        }
    }
}

fn parse_bool(var: &str, value: &str) -> common::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(common::Error::Env {
            var: var.into(),
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}

/// Serializes tests that mutate environment variables.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
