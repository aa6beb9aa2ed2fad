//! Single-file SQLite store for account rows
//!
//! Every operation opens its own connection to the database file on a
//! blocking thread, mirroring how several processes can share one file. An
//! in-process mutex totally orders operations from this process; contention
//! with writers in other processes surfaces as `SQLITE_BUSY`/`SQLITE_LOCKED`
//! and is retried with capped exponential backoff before giving up.
//!
//! The default rollback journal is kept (no WAL) so the database stays a
//! single self-contained file that can be copied to and from blob storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, is_busy};
use crate::migrations;

/// Oldest SQLite accepted at open time (3.24.0, first release with upsert).
pub const MIN_SQLITE_VERSION: i32 = 3_024_000;

/// Default number of attempts before store contention becomes an error.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default time SQLite itself waits on a locked file before reporting busy.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Maps one result row to a value.
pub type RowMapper<T> = fn(&Row<'_>) -> rusqlite::Result<T>;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_retries: u32,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Handle to the account database file.
pub struct Store {
    path: PathBuf,
    options: StoreOptions,
    lock: Mutex<()>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    ///
    /// Fails fast with `EngineTooOld` if the linked SQLite is below
    /// [`MIN_SQLITE_VERSION`].
    pub async fn open(path: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        check_engine_version(rusqlite::version_number())?;

        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let store = Self {
            path,
            options,
            lock: Mutex::new(()),
        };
        let applied = store.with_connection(migrations::migrate).await?;
        info!(
            path = %store.path.display(),
            applied = applied.len(),
            version = migrations::latest_version(),
            "account store ready"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for any in-flight operation to finish, then release the handle.
    pub async fn close(self) {
        let _guard = self.lock.lock().await;
        info!(path = %self.path.display(), "account store closed");
    }

    /// Apply one mutating statement; returns the number of rows changed.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<usize> {
        let sql = sql.to_owned();
        self.with_connection(move |conn| {
            Ok(conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?)
        })
        .await
    }

    /// Apply one statement per parameter set, all in a single transaction.
    pub async fn execute_many(&self, sql: &str, batch: Vec<Vec<Value>>) -> Result<usize> {
        let sql = sql.to_owned();
        self.transaction(move |tx| {
            let mut stmt = tx.prepare(&sql)?;
            let mut changed = 0;
            for params in &batch {
                changed += stmt.execute(rusqlite::params_from_iter(params.iter()))?;
            }
            Ok(changed)
        })
        .await
    }

    /// Return the first row of the query, if any.
    pub async fn fetch_one<T>(
        &self,
        sql: &str,
        params: Vec<Value>,
        map: RowMapper<T>,
    ) -> Result<Option<T>>
    where
        T: Send + 'static,
    {
        let sql = sql.to_owned();
        self.with_connection(move |conn| {
            Ok(conn
                .query_row(&sql, rusqlite::params_from_iter(params.iter()), map)
                .optional()?)
        })
        .await
    }

    /// Return every row of the query in the order the query produces.
    pub async fn fetch_all<T>(
        &self,
        sql: &str,
        params: Vec<Value>,
        map: RowMapper<T>,
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
    {
        let sql = sql.to_owned();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), map)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Run `f` inside an immediate (write-reserving) transaction.
    ///
    /// The reserved lock is taken before `f` reads anything, so a
    /// read-modify-write in `f` cannot interleave with another writer. If `f`
    /// fails the transaction rolls back. A busy failure reruns `f` from the
    /// start, so `f` must not have side effects outside the transaction.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Transaction<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Run `f` against a fresh connection under the process-wide mutex,
    /// retrying on cross-process lock contention.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T> + Send + Sync + 'static,
    {
        let _guard = self.lock.lock().await;
        let f = Arc::new(f);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let path = self.path.clone();
            let busy_timeout = self.options.busy_timeout;
            let f = Arc::clone(&f);

            let result = tokio::task::spawn_blocking(move || -> Result<T> {
                let mut conn = Connection::open(&path)?;
                conn.busy_timeout(busy_timeout)?;
                f(&mut conn)
            })
            .await
            .map_err(|e| Error::Task(e.to_string()))?;

            match result {
                Err(Error::Sqlite(source)) if is_busy(&source) => {
                    if attempt >= self.options.max_retries {
                        warn!(
                            path = %self.path.display(),
                            attempts = attempt,
                            "store still locked, giving up"
                        );
                        return Err(Error::StoreLocked {
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = backoff(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store locked by another writer, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based): doubling from 50ms, capped
/// at 2s, plus up to 50ms of jitter so competing processes drift apart.
fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let jitter = rand::rng().random_range(0..BACKOFF_BASE_MS);
    Duration::from_millis(exp.min(BACKOFF_CAP_MS) + jitter)
}

fn check_engine_version(found: i32) -> Result<()> {
    if found < MIN_SQLITE_VERSION {
        return Err(Error::EngineTooOld {
            found: format_version(found),
            required: format_version(MIN_SQLITE_VERSION),
        });
    }
    Ok(())
}

/// `3024000` → `"3.24.0"`
fn format_version(number: i32) -> String {
    format!(
        "{}.{}.{}",
        number / 1_000_000,
        (number / 1_000) % 1_000,
        number % 1_000
    )
}
