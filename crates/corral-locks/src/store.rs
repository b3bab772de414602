//! Distributed lock primitives over a shared key-value lock store.
//!
//! Locks are plain keys with a lease: acquisition is a set-if-absent with
//! an expiry, so a crashed holder frees its lock when the lease runs out.
//! Waiting replicas poll for key absence rather than competing to acquire,
//! because a waiter only needs evidence that the holder finished.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

/// Tracing target for lock-store operations.
const STORE_TARGET: &str = "corral_locks::store";

/// Errors raised by lock-store operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock store endpoint could not be parsed or connected to.
    #[error("failed to reach lock store: {source}")]
    Connect {
        /// Underlying client error.
        #[source]
        source: redis::RedisError,
    },
    /// A lock command failed after the connection was established.
    #[error("lock command for '{name}' failed: {source}")]
    Command {
        /// Lock name involved.
        name: String,
        /// Underlying client error.
        #[source]
        source: redis::RedisError,
    },
    /// A waiter's deadline elapsed while the lock was still held.
    #[error("lock '{name}' still held after {waited_secs}s")]
    WaitTimeout {
        /// Lock name involved.
        name: String,
        /// Seconds spent waiting.
        waited_secs: u64,
    },
}

/// A leased, named mutual-exclusion primitive shared across replicas.
pub trait LockStore: Send + Sync {
    /// Attempts to take the named lock with the given lease.
    ///
    /// Returns `Ok(true)` when this caller now holds the lock and
    /// `Ok(false)` when another holder already has it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the store is unreachable or the command
    /// fails.
    fn acquire(&self, name: &str, lease: Duration) -> Result<bool, LockError>;

    /// Blocks until the named lock is released or the deadline elapses.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::WaitTimeout`] when the deadline elapses with
    /// the lock still held, or another [`LockError`] when polling fails.
    fn wait(&self, name: &str, deadline: Duration, poll: Duration) -> Result<(), LockError>;

    /// Releases the named lock. Releasing an unheld lock is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the store is unreachable.
    fn release(&self, name: &str) -> Result<(), LockError>;

    /// Verifies the store is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the store does not answer.
    fn ping(&self) -> Result<(), LockError>;
}

/// Lock store backed by a Redis-compatible server.
pub struct RedisLockStore {
    client: redis::Client,
    holder: String,
}

impl RedisLockStore {
    /// Builds a store for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Connect`] when the endpoint URL is invalid.
    pub fn connect(
        host: &str,
        port: u16,
        password: Option<&str>,
        tls: bool,
    ) -> Result<Self, LockError> {
        let scheme = if tls { "rediss" } else { "redis" };
        let url = match password {
            Some(password) => format!("{scheme}://:{password}@{host}:{port}/"),
            None => format!("{scheme}://{host}:{port}/"),
        };
        let client =
            redis::Client::open(url).map_err(|source| LockError::Connect { source })?;
        let holder = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("pid-{}", std::process::id()));
        Ok(Self { client, holder })
    }

    fn connection(&self, name: &str) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|source| LockError::Command {
                name: name.to_owned(),
                source,
            })
    }
}

impl LockStore for RedisLockStore {
    fn acquire(&self, name: &str, lease: Duration) -> Result<bool, LockError> {
        let mut connection = self.connection(name)?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(&self.holder)
            .arg("NX")
            .arg("EX")
            .arg(lease.as_secs())
            .query(&mut connection)
            .map_err(|source| LockError::Command {
                name: name.to_owned(),
                source,
            })?;
        let acquired = reply.is_some();
        debug!(
            target: STORE_TARGET,
            lock = name,
            acquired,
            lease_secs = lease.as_secs(),
            "lock acquisition attempted"
        );
        Ok(acquired)
    }

    fn wait(&self, name: &str, deadline: Duration, poll: Duration) -> Result<(), LockError> {
        let started = Instant::now();
        loop {
            let mut connection = self.connection(name)?;
            let held: bool = redis::cmd("EXISTS")
                .arg(name)
                .query(&mut connection)
                .map_err(|source| LockError::Command {
                    name: name.to_owned(),
                    source,
                })?;
            if !held {
                debug!(target: STORE_TARGET, lock = name, "lock released by holder");
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(LockError::WaitTimeout {
                    name: name.to_owned(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            trace!(target: STORE_TARGET, lock = name, "lock still held, polling");
            std::thread::sleep(poll);
        }
    }

    fn release(&self, name: &str) -> Result<(), LockError> {
        let mut connection = self.connection(name)?;
        redis::cmd("DEL")
            .arg(name)
            .query::<()>(&mut connection)
            .map_err(|source| LockError::Command {
                name: name.to_owned(),
                source,
            })?;
        debug!(target: STORE_TARGET, lock = name, "lock released");
        Ok(())
    }

    fn ping(&self) -> Result<(), LockError> {
        let mut connection = self
            .client
            .get_connection()
            .map_err(|source| LockError::Connect { source })?;
        redis::cmd("PING")
            .query::<String>(&mut connection)
            .map_err(|source| LockError::Connect { source })?;
        Ok(())
    }
}
