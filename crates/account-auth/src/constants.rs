//! Defaults for session-cookie authentication
//!
//! These match the cookie names the scraped service issues to a logged-in
//! browser. They can all be overridden through `SessionAuthConfig`.

/// Cookie carrying the CSRF token that must be echoed back as a header.
pub const DEFAULT_CSRF_COOKIE: &str = "ct0";

/// Header the CSRF token is echoed into.
pub const DEFAULT_CSRF_HEADER: &str = "x-csrf-token";

/// Cookies that must be present before a session counts as logged in.
pub const DEFAULT_REQUIRED_COOKIES: &[&str] = &["auth_token", "ct0"];

/// Header whose presence marks an account as logged in.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Timeout for the optional session verification request, in seconds.
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 30;
