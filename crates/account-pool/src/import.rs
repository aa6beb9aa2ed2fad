//! Bulk account import from delimited text files
//!
//! A line format template such as `username:password:email:email_password:_:cookies`
//! names the columns of each line. The delimiter is the first character of
//! the template that is not alphanumeric or `_`; a `_` column is skipped.

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::pool::{NewAccount, Pool};

/// A column of an import line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Username,
    Password,
    Email,
    EmailPassword,
    UserAgent,
    Proxy,
    Cookies,
    MfaCode,
    Skip,
}

impl Column {
    fn from_token(token: &str) -> Result<Self> {
        Ok(match token {
            "username" => Column::Username,
            "password" => Column::Password,
            "email" => Column::Email,
            "email_password" => Column::EmailPassword,
            "user_agent" => Column::UserAgent,
            "proxy" => Column::Proxy,
            "cookies" => Column::Cookies,
            "mfa_code" => Column::MfaCode,
            "_" => Column::Skip,
            other => return Err(Error::Import(format!("unknown column {other:?}"))),
        })
    }
}

const REQUIRED: &[(Column, &str)] = &[
    (Column::Username, "username"),
    (Column::Password, "password"),
    (Column::Email, "email"),
    (Column::EmailPassword, "email_password"),
];

/// Parsed line format template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFormat {
    delimiter: char,
    columns: Vec<Column>,
}

impl LineFormat {
    pub fn parse(template: &str) -> Result<Self> {
        let template = template.trim();
        let delimiter = template
            .chars()
            .find(|c| !c.is_alphanumeric() && *c != '_')
            .ok_or_else(|| {
                Error::Import(format!("line format {template:?} has no delimiter"))
            })?;

        let columns = template
            .split(delimiter)
            .map(|token| Column::from_token(token.trim()))
            .collect::<Result<Vec<_>>>()?;

        for (i, column) in columns.iter().enumerate() {
            if *column != Column::Skip && columns[..i].contains(column) {
                return Err(Error::Import(format!(
                    "column {:?} appears twice in line format",
                    column
                )));
            }
        }
        for (column, name) in REQUIRED {
            if !columns.contains(column) {
                return Err(Error::Import(format!("line format is missing {name}")));
            }
        }

        Ok(Self { delimiter, columns })
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Split one line into an account. The last column keeps any remaining
    /// delimiters, so JSON cookies can sit at the end of the line.
    pub fn parse_line(&self, line: &str) -> Result<NewAccount> {
        let mut username = None;
        let mut password = None;
        let mut email = None;
        let mut email_password = None;
        let mut user_agent = None;
        let mut proxy = None;
        let mut cookies = None;
        let mut mfa_code = None;

        let fields = line.splitn(self.columns.len(), self.delimiter);
        for (column, field) in self.columns.iter().zip(fields) {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let value = Some(field.to_owned());
            match column {
                Column::Username => username = value,
                Column::Password => password = value,
                Column::Email => email = value,
                Column::EmailPassword => email_password = value,
                Column::UserAgent => user_agent = value,
                Column::Proxy => proxy = value,
                Column::Cookies => cookies = value,
                Column::MfaCode => mfa_code = value,
                Column::Skip => {}
            }
        }

        let required = |value: Option<String>, name: &str| {
            value.ok_or_else(|| Error::Import(format!("missing {name}")))
        };
        let mut account = NewAccount::new(
            required(username, "username")?,
            required(password, "password")?,
            required(email, "email")?,
            required(email_password, "email_password")?,
        );
        account.user_agent = user_agent;
        account.proxy = proxy;
        account.cookies = cookies;
        account.mfa_code = mfa_code.map(Into::into);
        Ok(account)
    }
}

/// Counts from [`Pool::import_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub added: usize,
    /// Username already present.
    pub skipped: usize,
    /// Line did not match the format.
    pub invalid: usize,
}

impl Pool {
    /// Add every account listed in `path`. Blank lines and `#` comments are
    /// ignored; malformed lines are logged and counted, not fatal.
    pub async fn import_file(&self, path: &Path, format: &LineFormat) -> Result<ImportReport> {
        let text = tokio::fs::read_to_string(path).await?;
        let mut report = ImportReport::default();

        for (number, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match format.parse_line(trimmed) {
                Ok(account) => {
                    if self.add_account(account).await? {
                        report.added += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), line = number + 1, error = %e, "skipping invalid line");
                    report.invalid += 1;
                }
            }
        }

        info!(
            path = %path.display(),
            added = report.added,
            skipped = report.skipped,
            invalid = report.invalid,
            "account import finished"
        );
        Ok(report)
    }
}
