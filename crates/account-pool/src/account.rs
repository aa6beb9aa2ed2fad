//! Account record and its row mapping
//!
//! `locks`, `stats`, `headers` and `cookies` are stored as JSON text columns
//! and always read and written as whole maps.

use std::collections::BTreeMap;

use account_auth::{Credentials, Session};
use chrono::{DateTime, SecondsFormat, Utc};
use common::Secret;
use rusqlite::Row;
use rusqlite::types::{Type, Value};
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Queue name → instant the account becomes usable for that queue again.
pub type Locks = BTreeMap<String, DateTime<Utc>>;

/// Queue name → cumulative number of requests made through that queue.
pub type Stats = BTreeMap<String, u64>;

/// Column list matching [`Account::from_row`].
pub const ACCOUNT_COLUMNS: &str = "username, password, email, email_password, user_agent, \
     active, locks, stats, headers, cookies, proxy, error_msg, last_used, mfa_code";

/// One credentialed identity in the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub username: String,
    pub credentials: Credentials,
    pub session: Session,
    pub proxy: Option<String>,
    pub active: bool,
    pub locks: Locks,
    pub stats: Stats,
    pub last_used: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
}

impl Account {
    /// Map a row selected with [`ACCOUNT_COLUMNS`].
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mfa_code: Option<String> = row.get("mfa_code")?;
        let last_used: Option<String> = row.get("last_used")?;
        let last_used = match last_used {
            Some(text) => Some(parse_timestamp(&text).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e))
            })?),
            None => None,
        };

        Ok(Self {
            username: row.get("username")?,
            credentials: Credentials {
                password: Secret::new(row.get("password")?),
                email: row.get("email")?,
                email_password: Secret::new(row.get("email_password")?),
                mfa_code: mfa_code.map(Secret::new),
            },
            session: Session {
                user_agent: row.get("user_agent")?,
                headers: json_column(row, 8, "headers")?,
                cookies: json_column(row, 9, "cookies")?,
            },
            proxy: row.get("proxy")?,
            active: row.get("active")?,
            locks: json_column(row, 6, "locks")?,
            stats: json_column(row, 7, "stats")?,
            last_used,
            error_msg: row.get("error_msg")?,
        })
    }

    /// Parameters in [`ACCOUNT_COLUMNS`] order.
    pub fn to_params(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.username.clone()),
            Value::Text(self.credentials.password.expose().clone()),
            Value::Text(self.credentials.email.clone()),
            Value::Text(self.credentials.email_password.expose().clone()),
            Value::Text(self.session.user_agent.clone()),
            Value::Integer(self.active as i64),
            Value::Text(serde_json::to_string(&self.locks)?),
            Value::Text(serde_json::to_string(&self.stats)?),
            Value::Text(serde_json::to_string(&self.session.headers)?),
            Value::Text(serde_json::to_string(&self.session.cookies)?),
            optional_text(self.proxy.clone()),
            optional_text(self.error_msg.clone()),
            optional_text(self.last_used.map(format_timestamp)),
            optional_text(
                self.credentials
                    .mfa_code
                    .as_ref()
                    .map(|code| code.expose().clone()),
            ),
        ])
    }

    /// Whether `queue` is locked for this account at `now`.
    pub fn is_locked_for(&self, queue: &str, now: DateTime<Utc>) -> bool {
        self.locks.get(queue).is_some_and(|until| *until > now)
    }

    /// Active and not locked for `queue`.
    pub fn is_available_for(&self, queue: &str, now: DateTime<Utc>) -> bool {
        self.active && !self.is_locked_for(queue, now)
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.is_logged_in()
    }

    /// Requests made through every queue combined.
    pub fn total_requests(&self) -> u64 {
        self.stats.values().sum()
    }
}

/// Timestamps are stored as RFC 3339 in UTC.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|at| at.with_timezone(&Utc))
}

pub(crate) fn optional_text(value: Option<String>) -> Value {
    value.map(Value::Text).unwrap_or(Value::Null)
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize, name: &str) -> rusqlite::Result<T> {
    let text: String = row.get(name)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
