//! Accounts pool: lifecycle transitions and the per-queue checkout protocol
//!
//! The pool is the only writer of account rows. Every read-modify-write of the
//! JSON map columns runs inside one immediate store transaction, so lock and
//! usage updates from concurrent callers never interleave.
//!
//! Checkout protocol:
//! 1. `get_for_queue` picks the first active account not locked for the queue
//!    and locks it for `lock_duration` in the same transaction
//! 2. The caller does its work, then reports back via `unlock` (success),
//!    `lock_until` (rate limited) or `mark_inactive` (credential rejected)
//! 3. Locks are per (account, queue): one account can serve several queues

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use account_auth::{Authenticator, Credentials, LoginContext, Session};
use chrono::{DateTime, Local, TimeDelta, Utc};
use common::Secret;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::account::{ACCOUNT_COLUMNS, Account, Locks, Stats, format_timestamp, optional_text};
use crate::error::{Error, Result};
use crate::outcome::Outcome;
use crate::store::{Store, StoreOptions};

/// Default time an account stays locked for a queue after checkout.
pub const DEFAULT_LOCK_MINUTES: i64 = 15;

/// Default delay between checkout attempts in [`Pool::get_for_queue_or_wait`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const ERROR_PREVIEW_CHARS: usize = 60;

/// Usernames bound per `IN (...)` query, well under SQLite's variable limit.
const MAX_BOUND_PARAMS: usize = 500;

/// Order in which checkout scans active accounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountOrder {
    /// Deterministic, alphabetical by username.
    #[default]
    Username,
    Random,
}

impl AccountOrder {
    fn sql(self) -> &'static str {
        match self {
            AccountOrder::Username => "username",
            AccountOrder::Random => "RANDOM()",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub lock_duration: TimeDelta,
    pub poll_interval: Duration,
    /// Fail with `NoAccount` instead of polling when a queue is exhausted.
    pub raise_when_no_account: bool,
    pub order: AccountOrder,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            lock_duration: TimeDelta::minutes(DEFAULT_LOCK_MINUTES),
            poll_interval: DEFAULT_POLL_INTERVAL,
            raise_when_no_account: false,
            order: AccountOrder::default(),
        }
    }
}

/// Input to [`Pool::add_account`].
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub password: Secret<String>,
    pub email: String,
    pub email_password: Secret<String>,
    /// A random browser persona is assigned when absent.
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    /// Raw cookie text in any format [`account_auth::parse_cookies`] accepts.
    pub cookies: Option<String>,
    pub mfa_code: Option<Secret<String>>,
}

impl NewAccount {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<Secret<String>>,
        email: impl Into<String>,
        email_password: impl Into<Secret<String>>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            email: email.into(),
            email_password: email_password.into(),
            user_agent: None,
            proxy: None,
            cookies: None,
            mfa_code: None,
        }
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn cookies(mut self, cookies: impl Into<String>) -> Self {
        self.cookies = Some(cookies.into());
        self
    }

    pub fn mfa_code(mut self, mfa_code: impl Into<Secret<String>>) -> Self {
        self.mfa_code = Some(mfa_code.into());
        self
    }
}

/// Result of a batch login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoginSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Aggregate pool counts for operational visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    /// Queue → number of active accounts currently locked for it.
    pub locked: BTreeMap<String, usize>,
}

/// One row of [`Pool::accounts_info`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountInfo {
    pub username: String,
    pub logged_in: bool,
    pub active: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub total_req: u64,
    pub error_msg: Option<String>,
}

/// Earliest moment some active account frees up for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAvailable {
    Now,
    At(DateTime<Utc>),
}

impl fmt::Display for NextAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextAvailable::Now => f.write_str("now"),
            NextAvailable::At(at) => write!(f, "{}", at.with_timezone(&Local).format("%H:%M:%S")),
        }
    }
}

/// Persistent pool of credentialed accounts.
///
/// Constructed explicitly and passed by reference; share it between tasks
/// with `Arc<Pool>`.
pub struct Pool {
    store: Store,
    authenticator: Arc<dyn Authenticator>,
    settings: PoolSettings,
}

impl Pool {
    /// Open the store at `path` (running migrations) and build a pool on it.
    pub async fn open(
        path: impl Into<PathBuf>,
        store_options: StoreOptions,
        authenticator: Arc<dyn Authenticator>,
        settings: PoolSettings,
    ) -> Result<Self> {
        let store = Store::open(path, store_options).await?;
        Ok(Self::new(store, authenticator, settings))
    }

    pub fn new(store: Store, authenticator: Arc<dyn Authenticator>, settings: PoolSettings) -> Self {
        info!(
            path = %store.path().display(),
            authenticator = authenticator.id(),
            lock_minutes = settings.lock_duration.num_minutes(),
            "account pool initialized"
        );
        Self {
            store,
            authenticator,
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Finish in-flight store work and release the pool.
    pub async fn close(self) {
        self.store.close().await;
    }

    /// Insert a new account. Returns `false` (and changes nothing) when the
    /// username already exists.
    ///
    /// The account starts active iff its cookies parse to a non-empty map.
    pub async fn add_account(&self, new: NewAccount) -> Result<bool> {
        let cookies = match new.cookies.as_deref() {
            Some(raw) => account_auth::parse_cookies(raw).unwrap_or_else(|e| {
                warn!(username = %new.username, error = %e, "ignoring unparseable cookies");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };

        let mut session = Session::new(
            new.user_agent
                .unwrap_or_else(account_auth::random_user_agent),
        );
        session.cookies = cookies;

        let account = Account {
            active: !session.cookies.is_empty(),
            username: new.username,
            credentials: Credentials {
                password: new.password,
                email: new.email,
                email_password: new.email_password,
                mfa_code: new.mfa_code,
            },
            session,
            proxy: new.proxy,
            locks: Locks::new(),
            stats: Stats::new(),
            last_used: None,
            error_msg: None,
        };

        let sql = format!(
            "INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES ({}) \
             ON CONFLICT(username) DO NOTHING",
            placeholders(1, column_names().len())
        );
        let inserted = self.store.execute(&sql, account.to_params()?).await?;
        if inserted == 0 {
            warn!(username = %account.username, "account already exists, not added");
            return Ok(false);
        }

        info!(
            username = %account.username,
            active = account.active,
            "account added"
        );
        Ok(true)
    }

    /// Remove the given accounts; unknown usernames are ignored.
    pub async fn delete_accounts(&self, usernames: &[String]) -> Result<usize> {
        let unique = unique_usernames(usernames);
        if unique.is_empty() {
            return Ok(0);
        }
        let batch = unique
            .iter()
            .map(|username| vec![Value::Text(username.clone())])
            .collect();
        let deleted = self
            .store
            .execute_many("DELETE FROM accounts WHERE username = ?1", batch)
            .await?;
        info!(requested = unique.len(), deleted, "accounts deleted");
        Ok(deleted)
    }

    pub async fn delete_inactive(&self) -> Result<usize> {
        let deleted = self
            .store
            .execute("DELETE FROM accounts WHERE active = false", vec![])
            .await?;
        info!(deleted, "inactive accounts deleted");
        Ok(deleted)
    }

    /// Fetch one account or fail with `NotFound`.
    pub async fn get(&self, username: &str) -> Result<Account> {
        self.get_account(username)
            .await?
            .ok_or_else(|| Error::NotFound(username.to_owned()))
    }

    pub async fn get_account(&self, username: &str) -> Result<Option<Account>> {
        self.store
            .fetch_one(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = ?1"),
                vec![Value::Text(username.to_owned())],
                Account::from_row,
            )
            .await
    }

    /// Every account, ordered by username.
    pub async fn get_all(&self) -> Result<Vec<Account>> {
        self.store
            .fetch_all(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY username"),
                vec![],
                Account::from_row,
            )
            .await
    }

    /// Write the whole row, inserting it if missing.
    pub async fn save(&self, account: &Account) -> Result<()> {
        let updates = column_names()
            .iter()
            .filter(|name| **name != "username")
            .map(|name| format!("{name} = excluded.{name}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES ({}) \
             ON CONFLICT(username) DO UPDATE SET {updates}",
            placeholders(1, column_names().len())
        );
        self.store.execute(&sql, account.to_params()?).await?;
        Ok(())
    }

    /// Authenticate one account and persist the result.
    ///
    /// Authentication failures are logged, recorded in `error_msg` and
    /// reported as `Ok(false)`. Whatever session state the attempt left
    /// behind is saved either way. Only store failures are returned as errors.
    pub async fn login(&self, account: &mut Account) -> Result<bool> {
        let ctx = LoginContext {
            username: &account.username,
            credentials: &account.credentials,
            proxy: account.proxy.as_deref(),
        };
        let result = self.authenticator.login(ctx, &mut account.session).await;

        let success = match result {
            Ok(()) => {
                account.active = true;
                account.error_msg = None;
                info!(username = %account.username, "logged in");
                true
            }
            Err(e) => {
                account.active = false;
                account.error_msg = Some(e.to_string());
                warn!(username = %account.username, error = %e, "login failed");
                false
            }
        };
        let result = if success { "success" } else { "failed" };
        metrics::counter!("account_pool_logins_total", "result" => result).increment(1);

        self.save_session(account).await?;
        Ok(success)
    }

    /// Persist only the columns a login attempt owns. Locks and usage may
    /// have changed while the handshake was in flight and are left alone.
    async fn save_session(&self, account: &Account) -> Result<()> {
        self.store
            .execute(
                "UPDATE accounts SET user_agent = ?2, headers = ?3, cookies = ?4, \
                 active = ?5, error_msg = ?6 WHERE username = ?1",
                vec![
                    Value::Text(account.username.clone()),
                    Value::Text(account.session.user_agent.clone()),
                    Value::Text(serde_json::to_string(&account.session.headers)?),
                    Value::Text(serde_json::to_string(&account.session.cookies)?),
                    Value::Integer(account.active as i64),
                    optional_text(account.error_msg.clone()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Log in the given accounts, or when `usernames` is `None` every inactive
    /// account that has not failed before.
    pub async fn login_all(&self, usernames: Option<&[String]>) -> Result<LoginSummary> {
        let accounts = match usernames {
            None => {
                self.store
                    .fetch_all(
                        &format!(
                            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
                             WHERE active = false AND error_msg IS NULL ORDER BY username"
                        ),
                        vec![],
                        Account::from_row,
                    )
                    .await?
            }
            Some(usernames) => {
                let unique = unique_usernames(usernames);
                if unique.is_empty() {
                    return Ok(LoginSummary::default());
                }
                let mut accounts = Vec::with_capacity(unique.len());
                for chunk in unique.chunks(MAX_BOUND_PARAMS) {
                    let found = self
                        .store
                        .fetch_all(
                            &format!(
                                "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username IN ({})",
                                placeholders(1, chunk.len())
                            ),
                            text_params(chunk),
                            Account::from_row,
                        )
                        .await?;
                    accounts.extend(found);
                }
                accounts.sort_by_key(|account: &Account| account.username.to_lowercase());
                accounts
            }
        };

        let mut summary = LoginSummary {
            total: accounts.len(),
            ..LoginSummary::default()
        };
        for (i, mut account) in accounts.into_iter().enumerate() {
            info!(
                username = %account.username,
                progress = %format!("{}/{}", i + 1, summary.total),
                "logging in"
            );
            if self.login(&mut account).await? {
                summary.success += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            total = summary.total,
            success = summary.success,
            failed = summary.failed,
            "login batch finished"
        );
        Ok(summary)
    }

    /// Reset the accounts to a clean pre-login state and log them in again.
    pub async fn relogin(&self, usernames: &[String]) -> Result<LoginSummary> {
        let unique = unique_usernames(usernames);
        if unique.is_empty() {
            return Ok(LoginSummary::default());
        }

        let batch = unique
            .iter()
            .map(|username| {
                vec![
                    Value::Text(username.clone()),
                    Value::Text(account_auth::random_user_agent()),
                ]
            })
            .collect();
        self.store
            .execute_many(
                "UPDATE accounts SET active = false, locks = '{}', headers = '{}', \
                 cookies = '{}', user_agent = ?2, last_used = NULL, error_msg = NULL \
                 WHERE username = ?1",
                batch,
            )
            .await?;
        info!(accounts = unique.len(), "accounts reset for relogin");

        self.login_all(Some(unique.as_slice())).await
    }

    /// Relogin every account deactivated by an error.
    pub async fn relogin_failed(&self) -> Result<LoginSummary> {
        let usernames = self
            .store
            .fetch_all(
                "SELECT username FROM accounts \
                 WHERE active = false AND error_msg IS NOT NULL ORDER BY username",
                vec![],
                |row| row.get::<_, String>(0),
            )
            .await?;
        self.relogin(&usernames).await
    }

    /// Clear every queue lock on every account.
    pub async fn reset_locks(&self) -> Result<usize> {
        let changed = self
            .store
            .execute("UPDATE accounts SET locks = '{}'", vec![])
            .await?;
        info!(accounts = changed, "all queue locks reset");
        Ok(changed)
    }

    /// Returns whether the account exists.
    pub async fn set_active(&self, username: &str, active: bool) -> Result<bool> {
        let changed = self
            .store
            .execute(
                "UPDATE accounts SET active = ?2 WHERE username = ?1",
                vec![Value::Text(username.to_owned()), Value::Integer(active as i64)],
            )
            .await?;
        debug!(username, active, found = changed > 0, "active flag set");
        Ok(changed > 0)
    }

    /// Deactivate an account whose credential the service rejected.
    ///
    /// Rate limits are not fatal and go through [`Pool::lock_until`] instead.
    pub async fn mark_inactive(&self, username: &str, error_msg: &str) -> Result<bool> {
        let changed = self
            .store
            .execute(
                "UPDATE accounts SET active = false, error_msg = ?2 WHERE username = ?1",
                vec![
                    Value::Text(username.to_owned()),
                    Value::Text(error_msg.to_owned()),
                ],
            )
            .await?;
        if changed > 0 {
            metrics::counter!("account_pool_deactivations_total").increment(1);
            warn!(username, error_msg, "account marked inactive");
        }
        Ok(changed > 0)
    }

    /// Lock the account for `queue` until `until` and add `req_count` to its
    /// usage for that queue. Returns whether the account exists.
    pub async fn lock_until(
        &self,
        username: &str,
        queue: &str,
        until: DateTime<Utc>,
        req_count: u64,
    ) -> Result<bool> {
        let updated = self
            .record_usage(username, queue, Some(until), req_count)
            .await?;
        debug!(username, queue, %until, req_count, "queue locked");
        Ok(updated)
    }

    /// Remove the account's lock for `queue` and add `req_count` to its usage.
    pub async fn unlock(&self, username: &str, queue: &str, req_count: u64) -> Result<bool> {
        let updated = self.record_usage(username, queue, None, req_count).await?;
        debug!(username, queue, req_count, "queue unlocked");
        Ok(updated)
    }

    async fn record_usage(
        &self,
        username: &str,
        queue: &str,
        lock: Option<DateTime<Utc>>,
        req_count: u64,
    ) -> Result<bool> {
        let username = username.to_owned();
        let queue = queue.to_owned();
        self.store
            .transaction(move |tx| {
                let maps = tx
                    .query_row(
                        "SELECT locks, stats FROM accounts WHERE username = ?1",
                        [&username],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;
                let Some((locks, stats)) = maps else {
                    return Ok(false);
                };

                let mut locks: Locks = serde_json::from_str(&locks)?;
                let mut stats: Stats = serde_json::from_str(&stats)?;
                match lock {
                    Some(until) => {
                        locks.insert(queue.clone(), until);
                    }
                    None => {
                        locks.remove(&queue);
                    }
                }
                *stats.entry(queue.clone()).or_default() += req_count;

                tx.execute(
                    "UPDATE accounts SET locks = ?2, stats = ?3, last_used = ?4 WHERE username = ?1",
                    params![
                        username,
                        serde_json::to_string(&locks)?,
                        serde_json::to_string(&stats)?,
                        format_timestamp(Utc::now()),
                    ],
                )?;
                Ok(true)
            })
            .await
    }

    /// Check out an account for `queue`, locking it for `lock_duration`.
    ///
    /// Selection and locking happen in one immediate transaction: a second
    /// caller, in this process or another, sees the account already locked.
    pub async fn get_for_queue(&self, queue: &str) -> Result<Option<Account>> {
        let queue_name = queue.to_owned();
        let lock_duration = self.settings.lock_duration;
        let order = self.settings.order;
        let token = format!("{:016x}", rand::random::<u64>());

        let account = self
            .store
            .transaction(move |tx| {
                let now = Utc::now();
                let candidates = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT username, locks FROM accounts WHERE active = true ORDER BY {}",
                        order.sql()
                    ))?;
                    let rows = stmt
                        .query_map([], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };

                for (username, locks) in candidates {
                    let mut locks: Locks = serde_json::from_str(&locks)?;
                    if locks.get(&queue_name).is_some_and(|until| *until > now) {
                        continue;
                    }

                    locks.insert(queue_name.clone(), now + lock_duration);
                    tx.execute(
                        "UPDATE accounts SET locks = ?2, last_used = ?3, _tx = ?4 WHERE username = ?1",
                        params![
                            username,
                            serde_json::to_string(&locks)?,
                            format_timestamp(now),
                            token,
                        ],
                    )?;
                    let account = tx.query_row(
                        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE _tx = ?1"),
                        [&token],
                        Account::from_row,
                    )?;
                    return Ok(Some(account));
                }
                Ok(None)
            })
            .await?;

        match &account {
            Some(account) => {
                metrics::counter!("account_pool_checkouts_total", "queue" => queue.to_owned())
                    .increment(1);
                debug!(username = %account.username, queue, "account checked out");
            }
            None => {
                metrics::counter!("account_pool_checkout_misses_total", "queue" => queue.to_owned())
                    .increment(1);
                debug!(queue, "no account available");
            }
        }
        Ok(account)
    }

    /// Like [`Pool::get_for_queue`] but polls every `poll_interval` until an
    /// account frees up.
    ///
    /// Returns `Ok(None)` at once when there are no active accounts at all,
    /// and `Err(NoAccount)` instead of waiting when `raise_when_no_account` is
    /// set. There is no timeout: cancel the future to stop waiting.
    pub async fn get_for_queue_or_wait(&self, queue: &str) -> Result<Option<Account>> {
        let mut announced = false;
        loop {
            if let Some(account) = self.get_for_queue(queue).await? {
                if announced {
                    info!(username = %account.username, queue, "continuing with account");
                }
                return Ok(Some(account));
            }

            if self.settings.raise_when_no_account {
                return Err(Error::NoAccount(queue.to_owned()));
            }

            if self.count("active = true").await? == 0 {
                warn!(queue, "no active accounts, stopping");
                return Ok(None);
            }

            if !announced {
                let next = self
                    .next_available_at(queue)
                    .await?
                    .map(|next| next.to_string())
                    .unwrap_or_else(|| "unknown".to_owned());
                info!(queue, next_available = %next, "no account available for queue, waiting");
                announced = true;
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Earliest unlock time for `queue` across active accounts, or `None`
    /// when no active account is locked for it.
    pub async fn next_available_at(&self, queue: &str) -> Result<Option<NextAvailable>> {
        let rows = self
            .store
            .fetch_all(
                "SELECT locks FROM accounts WHERE active = true",
                vec![],
                |row| row.get::<_, String>(0),
            )
            .await?;

        let mut earliest: Option<DateTime<Utc>> = None;
        for locks in rows {
            let locks: Locks = serde_json::from_str(&locks)?;
            if let Some(until) = locks.get(queue) {
                earliest = Some(earliest.map_or(*until, |e| e.min(*until)));
            }
        }

        Ok(earliest.map(|at| {
            if at <= Utc::now() {
                NextAvailable::Now
            } else {
                NextAvailable::At(at)
            }
        }))
    }

    /// Apply the caller's verdict on a request made with `username`.
    pub async fn report(
        &self,
        username: &str,
        queue: &str,
        outcome: &Outcome,
        req_count: u64,
    ) -> Result<()> {
        match outcome {
            Outcome::Success => {
                self.unlock(username, queue, req_count).await?;
            }
            Outcome::RateLimited { until } => {
                info!(username, queue, %until, "rate limited, locking queue");
                self.lock_until(username, queue, *until, req_count).await?;
            }
            Outcome::Banned(reason) => {
                self.mark_inactive(username, reason).await?;
            }
            Outcome::Transient => {
                self.unlock(username, queue, 0).await?;
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let total = self.count("1 = 1").await?;
        let active = self.count("active = true").await?;
        let inactive = self.count("active = false").await?;

        let rows = self
            .store
            .fetch_all(
                "SELECT locks FROM accounts WHERE active = true",
                vec![],
                |row| row.get::<_, String>(0),
            )
            .await?;
        let now = Utc::now();
        let mut locked: BTreeMap<String, usize> = BTreeMap::new();
        for locks in rows {
            let locks: Locks = serde_json::from_str(&locks)?;
            for (queue, until) in locks {
                if until > now {
                    *locked.entry(queue).or_default() += 1;
                }
            }
        }

        Ok(PoolStats {
            total,
            active,
            inactive,
            locked,
        })
    }

    /// Diagnostic listing: active first, then most recently used (among
    /// accounts with any requests), then alphabetical.
    pub async fn accounts_info(&self) -> Result<Vec<AccountInfo>> {
        let mut items: Vec<AccountInfo> = self
            .get_all()
            .await?
            .into_iter()
            .map(|account| AccountInfo {
                logged_in: account.is_logged_in(),
                total_req: account.total_requests(),
                error_msg: account
                    .error_msg
                    .map(|msg| msg.chars().take(ERROR_PREVIEW_CHARS).collect()),
                username: account.username,
                active: account.active,
                last_used: account.last_used,
            })
            .collect();

        items.sort_by(compare_info);
        Ok(items)
    }

    async fn count(&self, filter: &str) -> Result<usize> {
        let count = self
            .store
            .fetch_one(
                &format!("SELECT COUNT(*) FROM accounts WHERE {filter}"),
                vec![],
                |row| row.get::<_, i64>(0),
            )
            .await?;
        Ok(count.unwrap_or(0) as usize)
    }
}

fn compare_info(a: &AccountInfo, b: &AccountInfo) -> Ordering {
    let recency = |info: &AccountInfo| info.last_used.filter(|_| info.total_req > 0);
    b.active
        .cmp(&a.active)
        .then_with(|| recency(b).cmp(&recency(a)))
        .then_with(|| a.username.to_lowercase().cmp(&b.username.to_lowercase()))
}

fn column_names() -> Vec<&'static str> {
    ACCOUNT_COLUMNS.split(',').map(str::trim).collect()
}

/// `?first, ?first+1, ...` for `count` parameters.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Case-insensitive dedupe, keeping the first spelling seen.
fn unique_usernames(usernames: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    usernames
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty() && seen.insert(u.to_lowercase()))
        .map(str::to_owned)
        .collect()
}

fn text_params(values: &[String]) -> Vec<Value> {
    values.iter().cloned().map(Value::Text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Authenticator that succeeds unless the username is listed in `fail`.
    /// A failed attempt still leaves a captured cookie behind.
    #[derive(Default)]
    struct ScriptedAuth {
        fail: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedAuth {
        fn failing(usernames: &[&str]) -> Self {
            Self {
                fail: usernames.iter().map(|u| u.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    impl Authenticator for ScriptedAuth {
        fn id(&self) -> &str {
            "scripted"
        }

        fn login<'a>(
            &'a self,
            ctx: LoginContext<'a>,
            session: &'a mut Session,
        ) -> Pin<Box<dyn Future<Output = account_auth::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(ctx.username.to_owned());
                session.cookies.insert("ct0".into(), "captured".into());
                if self.fail.iter().any(|u| u == ctx.username) {
                    return Err(account_auth::Error::InvalidCredentials(
                        "wrong password".into(),
                    ));
                }
                session
                    .headers
                    .insert("authorization".into(), "Bearer session".into());
                Ok(())
            })
        }
    }

    /// Authenticator that parks mid-handshake until released.
    #[derive(Default)]
    struct GatedAuth {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl Authenticator for GatedAuth {
        fn id(&self) -> &str {
            "gated"
        }

        fn login<'a>(
            &'a self,
            _ctx: LoginContext<'a>,
            session: &'a mut Session,
        ) -> Pin<Box<dyn Future<Output = account_auth::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                session
                    .headers
                    .insert("authorization".into(), "Bearer session".into());
                Ok(())
            })
        }
    }

    async fn test_pool_with(
        dir: &tempfile::TempDir,
        auth: ScriptedAuth,
        settings: PoolSettings,
    ) -> (Pool, Arc<ScriptedAuth>) {
        let auth = Arc::new(auth);
        let pool = Pool::open(
            dir.path().join("accounts.db"),
            StoreOptions::default(),
            auth.clone(),
            settings,
        )
        .await
        .unwrap();
        (pool, auth)
    }

    async fn test_pool(dir: &tempfile::TempDir) -> Pool {
        test_pool_with(dir, ScriptedAuth::default(), PoolSettings::default())
            .await
            .0
    }

    fn new_account(username: &str) -> NewAccount {
        NewAccount::new(username, "pw", format!("{username}@example.com"), "mailpw")
    }

    /// Add `username` as an active account (cookies supplied).
    async fn add_active(pool: &Pool, username: &str) {
        let added = pool
            .add_account(new_account(username).cookies(r#"{"ct0":"abc","auth_token":"t"}"#))
            .await
            .unwrap();
        assert!(added);
    }

    #[tokio::test]
    async fn add_sets_active_from_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        pool.add_account(new_account("plain")).await.unwrap();
        add_active(&pool, "cookied").await;
        pool.add_account(new_account("empty").cookies("{}"))
            .await
            .unwrap();
        pool.add_account(new_account("garbled").cookies("%%%not cookies%%%"))
            .await
            .unwrap();

        assert!(!pool.get("plain").await.unwrap().active);
        assert!(pool.get("cookied").await.unwrap().active);
        assert!(!pool.get("empty").await.unwrap().active);
        assert!(!pool.get("garbled").await.unwrap().active);

        let cookied = pool.get("cookied").await.unwrap();
        assert_eq!(cookied.session.cookies["ct0"], "abc");
        assert!(!cookied.session.user_agent.is_empty(), "random user agent assigned");
    }

    #[tokio::test]
    async fn duplicate_add_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        assert!(
            pool.add_account(new_account("alice").user_agent("ua-1"))
                .await
                .unwrap()
        );
        let again = NewAccount::new("ALICE", "other-pw", "x@example.com", "x")
            .user_agent("ua-2")
            .cookies("ct0=zzz");
        assert!(!pool.add_account(again).await.unwrap());

        let alice = pool.get("alice").await.unwrap();
        assert_eq!(alice.credentials.password.expose(), "pw");
        assert_eq!(alice.session.user_agent, "ua-1");
        assert!(!alice.active);
        assert_eq!(pool.accounts_info().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_missing_account() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        assert!(matches!(
            pool.get("ghost").await.unwrap_err(),
            Error::NotFound(name) if name == "ghost"
        ));
        assert!(pool.get_account("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookups_are_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "Alice").await;

        assert_eq!(pool.get("alice").await.unwrap().username, "Alice");
        assert!(pool.set_active("ALICE", false).await.unwrap());
    }

    #[tokio::test]
    async fn delete_accounts_dedupes_and_ignores_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "a").await;
        add_active(&pool, "b").await;
        add_active(&pool, "c").await;

        let deleted = pool
            .delete_accounts(&[
                "a".to_string(),
                "A".to_string(),
                "ghost".to_string(),
                "b".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining: Vec<String> = pool
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.username)
            .collect();
        assert_eq!(remaining, vec!["c"]);
        assert_eq!(pool.delete_accounts(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_accounts_beyond_sqlite_variable_limit() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "a").await;
        add_active(&pool, "b").await;
        add_active(&pool, "keep").await;

        let mut usernames: Vec<String> = (0..40_000).map(|i| format!("ghost{i}")).collect();
        usernames.push("b".to_string());
        usernames.push("a".to_string());
        assert_eq!(pool.delete_accounts(&usernames).await.unwrap(), 2);
        assert!(pool.get_account("keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_inactive_keeps_active() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "live").await;
        pool.add_account(new_account("dormant")).await.unwrap();

        assert_eq!(pool.delete_inactive().await.unwrap(), 1);
        assert!(pool.get_account("dormant").await.unwrap().is_none());
        assert!(pool.get_account("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_upserts_whole_row() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "alice").await;

        let mut alice = pool.get("alice").await.unwrap();
        alice.proxy = Some("socks5://127.0.0.1:9050".into());
        alice.stats.insert("tweets".into(), 4);
        pool.save(&alice).await.unwrap();
        assert_eq!(pool.get("alice").await.unwrap().proxy, alice.proxy);

        let mut bob = alice.clone();
        bob.username = "bob".into();
        pool.save(&bob).await.unwrap();
        assert_eq!(pool.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn locked_account_is_skipped_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "u").await;

        let now = Utc::now();
        pool.lock_until("u", "tweets", now + TimeDelta::hours(1), 0)
            .await
            .unwrap();
        assert!(pool.get_for_queue("tweets").await.unwrap().is_none());
        assert!(
            pool.get_for_queue("profile").await.unwrap().is_some(),
            "other queues are independent"
        );

        // Lock time already passed.
        pool.lock_until("u", "tweets", now - TimeDelta::seconds(1), 0)
            .await
            .unwrap();
        let account = pool.get_for_queue("tweets").await.unwrap().unwrap();
        assert_eq!(account.username, "u");
    }

    #[tokio::test]
    async fn unlock_makes_account_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "u").await;

        pool.lock_until("u", "tweets", Utc::now() + TimeDelta::days(1), 0)
            .await
            .unwrap();
        assert!(pool.unlock("u", "tweets", 0).await.unwrap());

        let u = pool.get("u").await.unwrap();
        assert!(!u.locks.contains_key("tweets"), "entry removed, not expired");
        assert!(pool.get_for_queue("tweets").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn usage_stats_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "u").await;

        let later = Utc::now() + TimeDelta::minutes(5);
        pool.lock_until("u", "tweets", later, 2).await.unwrap();
        pool.unlock("u", "tweets", 3).await.unwrap();
        pool.unlock("u", "tweets", 0).await.unwrap();
        pool.unlock("u", "profile", 7).await.unwrap();

        let u = pool.get("u").await.unwrap();
        assert_eq!(u.stats["tweets"], 5);
        assert_eq!(u.stats["profile"], 7);
        assert_eq!(u.total_requests(), 12);
        assert!(u.last_used.is_some());
    }

    #[tokio::test]
    async fn lock_and_unlock_unknown_account_affect_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        assert!(!pool.unlock("ghost", "tweets", 1).await.unwrap());
        assert!(
            !pool
                .lock_until("ghost", "tweets", Utc::now(), 1)
                .await
                .unwrap()
        );
        assert!(!pool.set_active("ghost", true).await.unwrap());
        assert!(!pool.mark_inactive("ghost", "gone").await.unwrap());
    }

    #[tokio::test]
    async fn checkout_picks_first_free_and_locks_it() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "a").await;
        add_active(&pool, "b").await;
        pool.lock_until("b", "x", Utc::now() + TimeDelta::hours(1), 0)
            .await
            .unwrap();

        let before = Utc::now();
        let account = pool.get_for_queue("x").await.unwrap().unwrap();
        assert_eq!(account.username, "a");

        let expected = before + TimeDelta::minutes(15);
        let until = account.locks["x"];
        assert!(
            (until - expected).num_seconds().abs() <= 5,
            "lock until {until}, expected about {expected}"
        );
        assert!(account.last_used.is_some());
        assert_eq!(pool.get("a").await.unwrap().locks["x"], until);

        // Both accounts are now locked for x.
        assert!(pool.get_for_queue("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkout_order_is_by_username() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        for name in ["carol", "alice", "bob"] {
            add_active(&pool, name).await;
        }

        let mut order = Vec::new();
        while let Some(account) = pool.get_for_queue("q").await.unwrap() {
            order.push(account.username);
        }
        assert_eq!(order, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn random_order_still_checks_out_each_account_once() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PoolSettings {
            order: AccountOrder::Random,
            ..PoolSettings::default()
        };
        let (pool, _) = test_pool_with(&dir, ScriptedAuth::default(), settings).await;
        for name in ["a", "b", "c"] {
            add_active(&pool, name).await;
        }

        let mut seen = BTreeSet::new();
        while let Some(account) = pool.get_for_queue("q").await.unwrap() {
            assert!(seen.insert(account.username));
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn inactive_account_is_never_checked_out() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) =
            test_pool_with(&dir, ScriptedAuth::default(), PoolSettings::default()).await;
        add_active(&pool, "a").await;

        assert!(pool.mark_inactive("a", "suspended").await.unwrap());
        let a = pool.get("a").await.unwrap();
        assert!(!a.active);
        assert_eq!(a.error_msg.as_deref(), Some("suspended"));
        for queue in ["tweets", "profile", "search"] {
            assert!(pool.get_for_queue(queue).await.unwrap().is_none());
        }

        pool.set_active("a", true).await.unwrap();
        assert!(pool.get_for_queue("tweets").await.unwrap().is_some());

        pool.mark_inactive("a", "suspended").await.unwrap();
        let summary = pool.relogin(&["a".to_string()]).await.unwrap();
        assert_eq!(summary.success, 1);
        assert!(pool.get_for_queue("profile").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_checkouts_never_share_an_account() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(test_pool(&dir).await);
        add_active(&pool, "only").await;

        let (first, second) = tokio::join!(pool.get_for_queue("y"), pool.get_for_queue("y"));
        let hits = [first.unwrap(), second.unwrap()]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(hits, 1);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.get_for_queue("z").await.unwrap() })
            })
            .collect();
        let mut hits = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                hits += 1;
            }
        }
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn wait_returns_none_without_active_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        pool.add_account(new_account("dormant")).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            pool.get_for_queue_or_wait("tweets"),
        )
        .await
        .expect("must not poll forever");
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn wait_raises_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PoolSettings {
            raise_when_no_account: true,
            ..PoolSettings::default()
        };
        let (pool, _) = test_pool_with(&dir, ScriptedAuth::default(), settings).await;
        add_active(&pool, "a").await;
        pool.lock_until("a", "tweets", Utc::now() + TimeDelta::hours(1), 0)
            .await
            .unwrap();

        let err = pool.get_for_queue_or_wait("tweets").await.unwrap_err();
        assert!(matches!(err, Error::NoAccount(q) if q == "tweets"));
    }

    #[tokio::test]
    async fn wait_polls_until_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PoolSettings {
            poll_interval: Duration::from_millis(20),
            ..PoolSettings::default()
        };
        let (pool, _) = test_pool_with(&dir, ScriptedAuth::default(), settings).await;
        let pool = Arc::new(pool);
        add_active(&pool, "a").await;
        pool.lock_until("a", "tweets", Utc::now() + TimeDelta::hours(1), 0)
            .await
            .unwrap();

        let releaser = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                pool.unlock("a", "tweets", 1).await.unwrap();
            })
        };

        let account = tokio::time::timeout(
            Duration::from_secs(5),
            pool.get_for_queue_or_wait("tweets"),
        )
        .await
        .expect("account should free up")
        .unwrap()
        .unwrap();
        assert_eq!(account.username, "a");
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn next_available_at_reports_earliest_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "a").await;
        add_active(&pool, "b").await;

        assert_eq!(pool.next_available_at("tweets").await.unwrap(), None);

        let soon = Utc::now() + TimeDelta::minutes(10);
        pool.lock_until("a", "tweets", soon + TimeDelta::minutes(20), 0)
            .await
            .unwrap();
        pool.lock_until("b", "tweets", soon, 0).await.unwrap();
        match pool.next_available_at("tweets").await.unwrap() {
            Some(NextAvailable::At(at)) => {
                assert!((at - soon).num_milliseconds().abs() <= 1)
            }
            other => panic!("unexpected: {other:?}"),
        }

        pool.lock_until("b", "tweets", Utc::now() - TimeDelta::seconds(5), 0)
            .await
            .unwrap();
        let next = pool.next_available_at("tweets").await.unwrap();
        assert_eq!(next, Some(NextAvailable::Now));
        assert_eq!(next.unwrap().to_string(), "now");

        // Inactive accounts do not count.
        pool.set_active("a", false).await.unwrap();
        pool.set_active("b", false).await.unwrap();
        assert_eq!(pool.next_available_at("tweets").await.unwrap(), None);
    }

    #[test]
    fn next_available_displays_clock_time() {
        let at = Utc::now();
        let shown = NextAvailable::At(at).to_string();
        assert_eq!(shown, at.with_timezone(&Local).format("%H:%M:%S").to_string());
        assert_eq!(shown.len(), 8);
    }

    #[tokio::test]
    async fn login_success_activates_and_persists_session() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, auth) =
            test_pool_with(&dir, ScriptedAuth::default(), PoolSettings::default()).await;
        pool.add_account(new_account("alice")).await.unwrap();

        let mut alice = pool.get("alice").await.unwrap();
        assert!(pool.login(&mut alice).await.unwrap());

        let stored = pool.get("alice").await.unwrap();
        assert!(stored.active);
        assert!(stored.is_logged_in());
        assert_eq!(stored.error_msg, None);
        assert_eq!(*auth.calls.lock().unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn login_failure_is_recorded_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = test_pool_with(
            &dir,
            ScriptedAuth::failing(&["mallory"]),
            PoolSettings::default(),
        )
        .await;
        add_active(&pool, "mallory").await;

        let mut mallory = pool.get("mallory").await.unwrap();
        assert!(!pool.login(&mut mallory).await.unwrap());

        let stored = pool.get("mallory").await.unwrap();
        assert!(!stored.active);
        assert!(!stored.is_logged_in());
        assert_eq!(stored.session.cookies["ct0"], "captured", "partial state kept");
        assert!(
            stored
                .error_msg
                .as_deref()
                .is_some_and(|msg| msg.contains("wrong password"))
        );
    }

    #[tokio::test]
    async fn login_all_defaults_to_fresh_inactive_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, auth) = test_pool_with(
            &dir,
            ScriptedAuth::failing(&["bad"]),
            PoolSettings::default(),
        )
        .await;
        add_active(&pool, "already").await;
        pool.add_account(new_account("fresh")).await.unwrap();
        pool.add_account(new_account("bad")).await.unwrap();
        pool.add_account(new_account("failed-before")).await.unwrap();
        pool.mark_inactive("failed-before", "banned").await.unwrap();

        let summary = pool.login_all(None).await.unwrap();
        assert_eq!(
            summary,
            LoginSummary {
                total: 2,
                success: 1,
                failed: 1
            }
        );
        assert_eq!(*auth.calls.lock().unwrap(), vec!["bad", "fresh"]);

        // Failed accounts are not retried by the default batch.
        let again = pool.login_all(None).await.unwrap();
        assert_eq!(again.total, 0);
    }

    #[tokio::test]
    async fn login_all_with_explicit_usernames() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, auth) =
            test_pool_with(&dir, ScriptedAuth::default(), PoolSettings::default()).await;
        add_active(&pool, "a").await;
        pool.add_account(new_account("b")).await.unwrap();

        let wanted = vec!["a".to_string(), "ghost".to_string()];
        let summary = pool.login_all(Some(wanted.as_slice())).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(*auth.calls.lock().unwrap(), vec!["a"]);

        let nobody: Vec<String> = Vec::new();
        assert_eq!(pool.login_all(Some(nobody.as_slice())).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn login_all_beyond_sqlite_variable_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, auth) =
            test_pool_with(&dir, ScriptedAuth::default(), PoolSettings::default()).await;
        pool.add_account(new_account("a")).await.unwrap();
        pool.add_account(new_account("b")).await.unwrap();

        let mut usernames: Vec<String> = (0..40_000).map(|i| format!("ghost{i}")).collect();
        usernames.push("b".to_string());
        usernames.push("a".to_string());
        let summary = pool.login_all(Some(usernames.as_slice())).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.success, 2);
        assert_eq!(*auth.calls.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn login_keeps_usage_and_locks_written_during_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(GatedAuth::default());
        let pool = Pool::open(
            dir.path().join("accounts.db"),
            StoreOptions::default(),
            auth.clone(),
            PoolSettings::default(),
        )
        .await
        .unwrap();
        add_active(&pool, "a").await;
        pool.unlock("a", "tweets", 10).await.unwrap();

        let wanted = vec!["a".to_string()];
        let (summary, checked_out) = tokio::join!(pool.login_all(Some(wanted.as_slice())), async {
            auth.entered.notified().await;
            pool.unlock("a", "tweets", 5).await.unwrap();
            let account = pool.get_for_queue("profile").await.unwrap();
            auth.release.notify_one();
            account
        });
        assert_eq!(summary.unwrap().success, 1);
        assert_eq!(checked_out.unwrap().username, "a");

        let a = pool.get("a").await.unwrap();
        assert_eq!(a.stats["tweets"], 15, "usage never goes backwards");
        assert!(a.locks.contains_key("profile"), "checkout lock survives login");
        assert!(a.active);
        assert!(a.is_logged_in());
        assert!(pool.get_for_queue("profile").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn relogin_resets_state_first() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = test_pool_with(
            &dir,
            ScriptedAuth::failing(&["a"]),
            PoolSettings::default(),
        )
        .await;
        add_active(&pool, "a").await;
        pool.lock_until("a", "tweets", Utc::now() + TimeDelta::hours(1), 3)
            .await
            .unwrap();
        pool.mark_inactive("a", "suspended").await.unwrap();

        let summary = pool.relogin(&["a".to_string()]).await.unwrap();
        assert_eq!(summary.failed, 1);

        let a = pool.get("a").await.unwrap();
        assert!(a.locks.is_empty());
        assert!(a.last_used.is_none());
        assert!(a.session.headers.is_empty());
        assert_eq!(
            a.session.cookies.keys().collect::<Vec<_>>(),
            vec!["ct0"],
            "only what the attempt captured"
        );
        assert_eq!(a.stats["tweets"], 3, "usage history survives");
        assert!(a.error_msg.is_some(), "new failure recorded");

        assert_eq!(pool.relogin(&[]).await.unwrap(), LoginSummary::default());
    }

    #[tokio::test]
    async fn relogin_failed_targets_errored_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, auth) =
            test_pool_with(&dir, ScriptedAuth::default(), PoolSettings::default()).await;
        add_active(&pool, "healthy").await;
        pool.add_account(new_account("never-tried")).await.unwrap();
        add_active(&pool, "banned").await;
        pool.mark_inactive("banned", "suspended").await.unwrap();

        let summary = pool.relogin_failed().await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(*auth.calls.lock().unwrap(), vec!["banned"]);
        assert!(pool.get("banned").await.unwrap().active);
    }

    #[tokio::test]
    async fn reset_locks_clears_every_queue() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "a").await;
        add_active(&pool, "b").await;
        let later = Utc::now() + TimeDelta::hours(1);
        pool.lock_until("a", "x", later, 0).await.unwrap();
        pool.lock_until("b", "y", later, 0).await.unwrap();

        assert_eq!(pool.reset_locks().await.unwrap(), 2);
        for account in pool.get_all().await.unwrap() {
            assert!(account.locks.is_empty());
        }
    }

    #[tokio::test]
    async fn stats_counts_future_locks_of_active_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "a").await;
        add_active(&pool, "b").await;
        add_active(&pool, "c").await;
        pool.add_account(new_account("d")).await.unwrap();

        let now = Utc::now();
        pool.lock_until("a", "tweets", now + TimeDelta::hours(1), 0)
            .await
            .unwrap();
        pool.lock_until("b", "tweets", now + TimeDelta::hours(1), 0)
            .await
            .unwrap();
        pool.lock_until("b", "profile", now - TimeDelta::hours(1), 0)
            .await
            .unwrap();
        pool.lock_until("c", "search", now + TimeDelta::hours(1), 0)
            .await
            .unwrap();
        pool.set_active("c", false).await.unwrap();

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.inactive, 2);
        assert_eq!(stats.locked.get("tweets"), Some(&2));
        assert_eq!(stats.locked.get("profile"), None, "expired lock");
        assert_eq!(stats.locked.get("search"), None, "inactive account");
    }

    #[tokio::test]
    async fn accounts_info_ordering_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        for name in ["delta", "Charlie", "bravo", "alpha"] {
            add_active(&pool, name).await;
        }
        pool.add_account(new_account("zulu")).await.unwrap();

        // bravo used most recently, Charlie before it; delta used but no requests.
        pool.unlock("Charlie", "q", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.unlock("bravo", "q", 2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.unlock("delta", "q", 0).await.unwrap();

        let long = "x".repeat(100);
        pool.mark_inactive("zulu", &long).await.unwrap();

        let info = pool.accounts_info().await.unwrap();
        let order: Vec<&str> = info.iter().map(|i| i.username.as_str()).collect();
        assert_eq!(order, vec!["bravo", "Charlie", "alpha", "delta", "zulu"]);

        let zulu = info.last().unwrap();
        assert!(!zulu.active);
        assert_eq!(zulu.error_msg.as_ref().map(|m| m.chars().count()), Some(60));
        assert_eq!(info[0].total_req, 2);
        assert!(!info[0].logged_in);
    }

    #[tokio::test]
    async fn report_applies_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "a").await;

        pool.get_for_queue("tweets").await.unwrap().unwrap();
        pool.report("a", "tweets", &Outcome::Success, 20)
            .await
            .unwrap();
        let a = pool.get("a").await.unwrap();
        assert!(!a.locks.contains_key("tweets"));
        assert_eq!(a.stats["tweets"], 20);

        let until = Utc::now() + TimeDelta::hours(2);
        pool.report("a", "tweets", &Outcome::RateLimited { until }, 1)
            .await
            .unwrap();
        assert!(pool.get("a").await.unwrap().is_locked_for("tweets", Utc::now()));

        pool.report("a", "profile", &Outcome::Transient, 99)
            .await
            .unwrap();
        assert_eq!(pool.get("a").await.unwrap().stats["profile"], 0);

        pool.report("a", "tweets", &Outcome::Banned("account suspended".into()), 0)
            .await
            .unwrap();
        let a = pool.get("a").await.unwrap();
        assert!(!a.active);
        assert_eq!(a.error_msg.as_deref(), Some("account suspended"));
        assert_eq!(a.stats["tweets"], 21);
    }

    #[tokio::test]
    async fn reopening_keeps_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        add_active(&pool, "a").await;
        pool.close().await;

        let pool = test_pool(&dir).await;
        assert!(pool.get("a").await.unwrap().active);
    }

    #[test]
    fn placeholder_lists() {
        assert_eq!(placeholders(1, 3), "?1, ?2, ?3");
        assert_eq!(placeholders(2, 1), "?2");
        assert_eq!(column_names().len(), 14);
        assert_eq!(column_names()[0], "username");
    }

    #[test]
    fn usernames_dedupe_case_insensitively() {
        let input = vec!["Bob".to_string(), "bob".into(), " ".into(), "amy".into()];
        assert_eq!(unique_usernames(&input), vec!["Bob", "amy"]);
    }
}
