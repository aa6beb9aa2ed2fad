//! Login contract and session helpers for pooled accounts
//!
//! The pool never talks to the remote service itself. It hands an account's
//! credentials and mutable session state to an [`Authenticator`], which runs
//! the service's handshake and leaves the resulting headers and cookies in
//! the session. Persisting that state is the pool's job.
//!
//! Also provided:
//! - `cookies`: parsing of the cookie formats accepted at import time
//! - `user_agent`: browser persona generation for new and re-logged accounts
//! - `session_auth`: an authenticator for accounts imported with session cookies

pub mod authenticator;
pub mod constants;
pub mod cookies;
pub mod error;
pub mod session;
pub mod session_auth;
pub mod user_agent;

pub use authenticator::{Authenticator, LoginContext};
pub use cookies::{cookie_header, parse_cookies};
pub use error::{Error, Result};
pub use session::{Credentials, Session};
pub use session_auth::{SessionAuthConfig, SessionAuthenticator};
pub use user_agent::random_user_agent;
