//! Versioned, additive schema migrations
//!
//! The schema version lives in SQLite's `user_version` header field. Each
//! migration runs in its own immediate transaction together with the version
//! bump, so a crash leaves the file at the last fully applied step.
//!
//! Steps are idempotent: a table or column that already exists
//! (for example because another process upgraded the file first) is skipped
//! rather than treated as a failure.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{Error, Result, is_busy};

/// One additive schema change.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    CreateTable {
        table: &'static str,
        ddl: &'static str,
    },
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub steps: &'static [Step],
}

/// All migrations, strictly ascending and without gaps.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_accounts",
        steps: &[Step::CreateTable {
            table: "accounts",
            ddl: "CREATE TABLE accounts (
                username       TEXT PRIMARY KEY NOT NULL COLLATE NOCASE,
                password       TEXT NOT NULL,
                email          TEXT NOT NULL COLLATE NOCASE,
                email_password TEXT NOT NULL,
                user_agent     TEXT NOT NULL,
                active         BOOLEAN DEFAULT FALSE NOT NULL,
                locks          TEXT DEFAULT '{}' NOT NULL,
                headers        TEXT DEFAULT '{}' NOT NULL,
                cookies        TEXT DEFAULT '{}' NOT NULL,
                proxy          TEXT DEFAULT NULL,
                error_msg      TEXT DEFAULT NULL
            )",
        }],
    },
    Migration {
        version: 2,
        name: "usage_stats",
        steps: &[
            Step::AddColumn {
                table: "accounts",
                column: "stats",
                definition: "TEXT DEFAULT '{}' NOT NULL",
            },
            Step::AddColumn {
                table: "accounts",
                column: "last_used",
                definition: "TEXT DEFAULT NULL",
            },
        ],
    },
    Migration {
        version: 3,
        name: "checkout_marker",
        steps: &[Step::AddColumn {
            table: "accounts",
            column: "_tx",
            definition: "TEXT DEFAULT NULL",
        }],
    },
    Migration {
        version: 4,
        name: "mfa_code",
        steps: &[Step::AddColumn {
            table: "accounts",
            column: "mfa_code",
            definition: "TEXT DEFAULT NULL",
        }],
    },
];

/// Highest version defined in [`MIGRATIONS`].
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Version recorded in the file; 0 for a new file.
pub fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Bring the schema up to [`latest_version`]. Returns the versions applied
/// by this call, in order.
pub fn migrate(conn: &mut Connection) -> Result<Vec<u32>> {
    let start = current_version(conn)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Another process may have migrated while we waited for the lock.
        if current_version(&tx)? >= migration.version {
            continue;
        }

        for step in migration.steps {
            apply_step(&tx, step).map_err(|e| migration_error(migration, e))?;
        }
        tx.pragma_update(None, "user_version", migration.version)
            .map_err(|e| migration_error(migration, e))?;
        tx.commit()?;

        info!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
        applied.push(migration.version);
    }

    Ok(applied)
}

fn apply_step(conn: &Connection, step: &Step) -> rusqlite::Result<()> {
    match *step {
        Step::CreateTable { table, ddl } => {
            if table_exists(conn, table)? {
                debug!(table, "table already exists, skipping");
                return Ok(());
            }
            conn.execute_batch(ddl)
        }
        Step::AddColumn {
            table,
            column,
            definition,
        } => {
            if column_exists(conn, table, column)? {
                debug!(table, column, "column already exists, skipping");
                return Ok(());
            }
            conn.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN {column} {definition}"
            ))
        }
    }
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name.eq_ignore_ascii_case(column)))
}

/// Busy errors stay retryable; anything else aborts the run.
fn migration_error(migration: &Migration, source: rusqlite::Error) -> Error {
    if is_busy(&source) {
        return Error::Sqlite(source);
    }
    Error::Migration {
        version: migration.version,
        name: migration.name,
        source,
    }
}
