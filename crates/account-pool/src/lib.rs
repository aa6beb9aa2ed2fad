//! Persistent pool of credentialed accounts with per-queue checkout
//!
//! Accounts live in a single SQLite file so the whole pool can be backed up or
//! restored as one blob. Several processes may share the file; contention is
//! retried by the store, and every checkout is one immediate transaction.
//!
//! Account lifecycle:
//! 1. Added (bulk import or `add_account`) → active only if it came with cookies
//! 2. Logged in through an `Authenticator` → active, session persisted
//! 3. Checked out for a queue → locked for that queue for `lock_duration`
//! 4. Caller reports back → unlocked with usage recorded, or locked until a
//!    rate-limit reset, or deactivated with `error_msg` when the credential is
//!    rejected
//! 5. `relogin` resets a deactivated account and runs step 2 again

pub mod account;
pub mod error;
pub mod import;
pub mod migrations;
pub mod outcome;
pub mod pool;
pub mod store;

pub use account::{Account, Locks, Stats};
pub use error::{Error, Result};
pub use import::{ImportReport, LineFormat};
pub use outcome::{Outcome, classify_status};
pub use pool::{
    AccountInfo, AccountOrder, LoginSummary, NewAccount, NextAvailable, Pool, PoolSettings,
    PoolStats,
};
pub use store::{Store, StoreOptions};
