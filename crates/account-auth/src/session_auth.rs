//! Authenticator for accounts imported with browser session cookies
//!
//! The service's full credential handshake is not reproduced here. Instead an
//! account that already carries session cookies is "logged in" by deriving the
//! request headers those cookies imply and, optionally, probing a verification
//! endpoint to confirm the session is still accepted.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use reqwest::header::{COOKIE, SET_COOKIE, USER_AGENT};
use tracing::{debug, info, warn};

use crate::authenticator::{Authenticator, LoginContext};
use crate::constants::{
    AUTHORIZATION_HEADER, DEFAULT_CSRF_COOKIE, DEFAULT_CSRF_HEADER, DEFAULT_REQUIRED_COOKIES,
    DEFAULT_VERIFY_TIMEOUT_SECS,
};
use crate::cookies::cookie_header;
use crate::error::{Error, Result};
use crate::session::Session;

/// Settings for [`SessionAuthenticator`].
///
/// Without a `bearer_token` a successful login leaves no `authorization`
/// header, so the account is active but reports `logged_in = false` in
/// account listings.
#[derive(Debug, Clone)]
pub struct SessionAuthConfig {
    /// Endpoint probed with the session; skipped when `None`.
    pub verify_url: Option<String>,
    /// Application bearer token sent as `authorization`. Accounts only count
    /// as logged in when this is set.
    pub bearer_token: Option<Secret<String>>,
    pub csrf_cookie: String,
    pub csrf_header: String,
    pub required_cookies: Vec<String>,
    pub timeout: Duration,
}

impl Default for SessionAuthConfig {
    fn default() -> Self {
        Self {
            verify_url: None,
            bearer_token: None,
            csrf_cookie: DEFAULT_CSRF_COOKIE.into(),
            csrf_header: DEFAULT_CSRF_HEADER.into(),
            required_cookies: DEFAULT_REQUIRED_COOKIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            timeout: Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
        }
    }
}

pub struct SessionAuthenticator {
    config: SessionAuthConfig,
    client: reqwest::Client,
}

impl SessionAuthenticator {
    pub fn new(config: SessionAuthConfig) -> Result<Self> {
        let client = build_client(None, config.timeout)?;
        if config.bearer_token.is_none() {
            warn!("no bearer token configured, logged-in accounts will report logged_in = false");
        }
        Ok(Self { config, client })
    }

    async fn authenticate(&self, ctx: LoginContext<'_>, session: &mut Session) -> Result<()> {
        let missing: Vec<&str> = self
            .config
            .required_cookies
            .iter()
            .filter(|name| !session.cookies.contains_key(name.as_str()))
            .map(|name| name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidCredentials(format!(
                "missing session cookies: {}",
                missing.join(", ")
            )));
        }

        if let Some(token) = &self.config.bearer_token {
            session.headers.insert(
                AUTHORIZATION_HEADER.into(),
                format!("Bearer {}", token.expose()),
            );
        }
        if let Some(csrf) = session.cookies.get(&self.config.csrf_cookie).cloned() {
            session.headers.insert(self.config.csrf_header.clone(), csrf);
        }

        if let Some(url) = &self.config.verify_url {
            self.verify(url, ctx, session).await?;
        }

        info!(username = ctx.username, "session authenticated");
        Ok(())
    }

    /// Probe `url` with the session and merge any cookies the service rotates.
    async fn verify(&self, url: &str, ctx: LoginContext<'_>, session: &mut Session) -> Result<()> {
        let client = match ctx.proxy {
            Some(proxy) => build_client(Some(proxy), self.config.timeout)?,
            None => self.client.clone(),
        };

        let mut request = client
            .get(url)
            .header(USER_AGENT, session.user_agent.as_str())
            .header(COOKIE, cookie_header(&session.cookies));
        for (name, value) in &session.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("session verification request failed: {e}")))?;

        for value in response.headers().get_all(SET_COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            let pair = value.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    session.cookies.insert(name.to_owned(), value.trim().to_owned());
                }
            }
        }

        let status = response.status();
        debug!(username = ctx.username, %status, "session verification response");
        match status.as_u16() {
            s if (200..300).contains(&s) => Ok(()),
            401 | 403 => Err(Error::InvalidCredentials(format!(
                "session rejected ({status})"
            ))),
            429 => Err(Error::Blocked(format!("verification rate limited ({status})"))),
            _ => Err(Error::Http(format!("verification returned {status}"))),
        }
    }
}

impl Authenticator for SessionAuthenticator {
    fn id(&self) -> &str {
        "session-cookie"
    }

    fn login<'a>(
        &'a self,
        ctx: LoginContext<'a>,
        session: &'a mut Session,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.authenticate(ctx, session))
    }
}

fn build_client(proxy: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| Error::Http(format!("invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| Error::Http(format!("building HTTP client: {e}")))
}
