//! Leased distributed locks and session-scoped release tracking.
//!
//! Replicas elect a leader by racing a set-if-absent key with an expiry on
//! a shared Redis-compatible store. [`LockSession`] records what this
//! process holds and drains it on normal exit, on drop, and on termination
//! signals, so a crashed-but-signalled replica never strands its peers
//! until the lease expires.

mod session;
mod store;

pub use session::{LockSession, SessionError};
pub use store::{LockError, LockStore, RedisLockStore};

/// Name of the lock serialising first-boot scaffolding.
pub const INIT_LOCK: &str = "init";

/// Name of the lock serialising module upgrades.
pub const UPGRADE_LOCK: &str = "upgrade";
