//! Waits for external dependencies before any coordination begins.

use std::time::{Duration, Instant};

use corral_config::Config;
use corral_locks::LockStore;
use thiserror::Error;
use tracing::{debug, info};

use crate::database::DbAdmin;

/// Tracing target for dependency readiness.
const READINESS_TARGET: &str = "corral_boot::readiness";

/// Errors raised while waiting for dependencies.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// A dependency stayed unreachable past its wait budget.
    #[error("{dependency} unreachable after {waited_secs}s: {last_error}")]
    Timeout {
        /// Human-readable dependency name.
        dependency: &'static str,
        /// Seconds spent waiting.
        waited_secs: u64,
        /// Last error observed while polling.
        last_error: String,
    },
}

/// Blocks until the lock store and the database both answer, in that order.
///
/// Each dependency gets the full configured wait budget; the lock store is
/// checked first because nothing can be coordinated without it.
///
/// # Errors
///
/// Returns [`ReadinessError::Timeout`] naming the dependency that stayed
/// unreachable.
pub fn await_dependencies(
    config: &Config,
    store: &dyn LockStore,
    db: &DbAdmin<'_>,
) -> Result<(), ReadinessError> {
    let budget = Duration::from_secs(config.dependency_wait_secs());
    let poll = Duration::from_secs(config.dependency_poll_secs());

    poll_until_ready("lock store", budget, poll, || {
        store.ping().map_err(|error| error.to_string())
    })?;
    poll_until_ready("database", budget, poll, || {
        db.ping().map_err(|error| error.to_string())
    })?;
    info!(target: READINESS_TARGET, "external dependencies reachable");
    Ok(())
}

fn poll_until_ready(
    dependency: &'static str,
    budget: Duration,
    poll: Duration,
    mut check: impl FnMut() -> Result<(), String>,
) -> Result<(), ReadinessError> {
    let started = Instant::now();
    loop {
        match check() {
            Ok(()) => {
                debug!(target: READINESS_TARGET, dependency, "dependency ready");
                return Ok(());
            }
            Err(last_error) => {
                if started.elapsed() >= budget {
                    return Err(ReadinessError::Timeout {
                        dependency,
                        waited_secs: started.elapsed().as_secs(),
                        last_error,
                    });
                }
                debug!(
                    target: READINESS_TARGET,
                    dependency,
                    error = %last_error,
                    "dependency not ready, polling"
                );
                std::thread::sleep(poll);
            }
        }
    }
}
