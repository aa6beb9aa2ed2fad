//! The login contract consumed by the pool

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::session::{Credentials, Session};

/// Read-only facts about the account being logged in.
#[derive(Debug, Clone, Copy)]
pub struct LoginContext<'a> {
    pub username: &'a str,
    pub credentials: &'a Credentials,
    /// Outbound proxy the login must go through, if any.
    pub proxy: Option<&'a str>,
}

/// Performs the remote service's authentication handshake for one account.
///
/// On success the implementation leaves the new headers, cookies and (if it
/// rotates personas) user agent in `session` and returns `Ok(())`. On failure
/// it returns an error, possibly after partially updating `session`; the pool
/// persists whatever state is left either way. Implementations never persist.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Authenticator>`).
pub trait Authenticator: Send + Sync {
    /// Identifier for logging (e.g. "session-cookie")
    fn id(&self) -> &str;

    fn login<'a>(
        &'a self,
        ctx: LoginContext<'a>,
        session: &'a mut Session,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
