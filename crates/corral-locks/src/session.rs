//! Tracks held locks and guarantees release on every exit path.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{LockError, LockStore};

/// Tracing target for session bookkeeping.
const SESSION_TARGET: &str = "corral_locks::session";

/// Errors raised while wiring signal-triggered release.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Bookkeeping wrapper that releases every held lock exactly once.
///
/// Release happens on explicit calls, on drop, and on termination signals
/// once [`LockSession::install_signal_release`] has run. All three paths
/// share one idempotent drain, so a signal racing normal shutdown cannot
/// double-release.
pub struct LockSession {
    store: Arc<dyn LockStore>,
    held: Mutex<Vec<String>>,
}

impl LockSession {
    /// Wraps a lock store in a session.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            held: Mutex::new(Vec::new()),
        })
    }

    /// Attempts acquisition, recording the lock on success.
    ///
    /// # Errors
    ///
    /// Propagates [`LockError`] from the underlying store.
    pub fn acquire(&self, name: &str, lease: Duration) -> Result<bool, LockError> {
        let acquired = self.store.acquire(name, lease)?;
        if acquired {
            let mut held = self.held.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            held.push(name.to_owned());
        }
        Ok(acquired)
    }

    /// Releases a single lock, forgetting it even when the store call fails.
    ///
    /// # Errors
    ///
    /// Propagates [`LockError`] from the underlying store.
    pub fn release(&self, name: &str) -> Result<(), LockError> {
        {
            let mut held = self.held.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            held.retain(|held_name| held_name != name);
        }
        self.store.release(name)
    }

    /// Releases every held lock. Safe to call repeatedly; failures are
    /// logged rather than propagated because this runs on exit paths.
    pub fn release_all(&self) {
        let drained: Vec<String> = {
            let mut held = self.held.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *held)
        };
        for name in drained {
            match self.store.release(&name) {
                Ok(()) => debug!(target: SESSION_TARGET, lock = %name, "lock released on exit"),
                Err(error) => warn!(
                    target: SESSION_TARGET,
                    lock = %name,
                    error = %error,
                    "failed to release lock on exit"
                ),
            }
        }
    }

    /// Spawns a listener that releases held locks when a termination
    /// signal arrives, then exits with the conventional signal code.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Install`] when handlers cannot be installed.
    pub fn install_signal_release(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
            .map_err(|source| SessionError::Install { source })?;
        let session = Arc::clone(self);
        std::thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                warn!(
                    target: SESSION_TARGET,
                    signal,
                    "termination signal received, releasing held locks"
                );
                session.release_all();
                std::process::exit(128 + signal);
            }
        });
        Ok(())
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        self.release_all();
    }
}
