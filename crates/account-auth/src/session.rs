//! Credential and session state handed to an authenticator

use std::collections::BTreeMap;

use common::Secret;

use crate::constants::AUTHORIZATION_HEADER;

/// What is needed to (re-)authenticate an account.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub password: Secret<String>,
    pub email: String,
    pub email_password: Secret<String>,
    /// Multi-factor secret, if the account has one enrolled.
    pub mfa_code: Option<Secret<String>>,
}

/// Session state produced by a login and replayed on every request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

impl Session {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..Self::default()
        }
    }

    /// Whether a login left an authorization-bearing header behind.
    ///
    /// Header names are compared case-insensitively.
    pub fn is_logged_in(&self) -> bool {
        self.headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case(AUTHORIZATION_HEADER) && !value.is_empty()
        })
    }

    /// Drop headers and cookies, keeping the user agent.
    pub fn clear(&mut self) {
        self.headers.clear();
        self.cookies.clear();
    }
}
