//! Build-stamp gated module upgrades with a bounded retry budget.
//!
//! Exactly one replica holds the upgrade lock; the others wait for it to
//! clear and treat that as the upgrade having happened. The holder compares
//! the image's build stamp against the persisted one and, when work is
//! needed, updates each module in isolation so a single broken module
//! cannot abort the rest. Failures are retried for a fixed number of
//! rounds; a partial failure is tolerated, a total one is not.

use std::time::Duration;

use camino::Utf8PathBuf;
use corral_config::Config;
use corral_locks::{LockError, LockSession, LockStore, UPGRADE_LOCK};
use corral_modules::{CatalogueError, FilterConfig, FilterError, resolve_with_mandatory};
use corral_state::{SemaphoreStore, Stamp, StateError};
use thiserror::Error;
use tracing::{info, warn};

use crate::appcmd;
use crate::exec::CommandRunner;

/// Tracing target for the upgrade engine.
const UPGRADE_TARGET: &str = "corral_boot::upgrade";

/// Rounds attempted before giving up on still-failing modules.
const MAX_ROUNDS: u32 = 3;

/// Errors raised by the upgrade engine.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The upgrade lock could not be taken or waited on.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Module roots could not be walked.
    #[error(transparent)]
    Resolve(#[from] CatalogueError),
    /// The filter configuration is invalid.
    #[error(transparent)]
    Filter(#[from] FilterError),
    /// The persisted stamp could not be read or advanced.
    #[error(transparent)]
    State(#[from] StateError),
    /// Every module in the upgrade set failed all retry rounds.
    #[error("upgrade failed for every module: {modules:?}")]
    TotalFailure {
        /// Modules that never succeeded.
        modules: Vec<String>,
    },
}

/// Whether the persisted stamp requires an upgrade against the build stamp.
///
/// The policy is conservative: an absent or unreadable persisted stamp
/// means the upgrade history is unknown, so work is assumed necessary.
#[must_use]
pub fn update_needed(build: i64, persisted: Stamp) -> bool {
    match persisted {
        Stamp::Absent | Stamp::Unparsable => true,
        Stamp::Value(value) => value < build,
    }
}

/// Accounting from one multi-round upgrade pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    attempted: usize,
    failed: Vec<String>,
}

impl UpgradeReport {
    /// Modules in the original set.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    /// Modules that never succeeded, in original order.
    #[must_use]
    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    /// Whether every module failed.
    #[must_use]
    pub fn total_failure(&self) -> bool {
        self.attempted > 0 && self.failed.len() == self.attempted
    }
}

/// Updates each module in isolation, retrying failures for up to
/// [`MAX_ROUNDS`] rounds with a pause between rounds that still have work.
pub fn run_rounds(
    config: &Config,
    runner: &dyn CommandRunner,
    roots: &[Utf8PathBuf],
    modules: &[String],
) -> UpgradeReport {
    let pause = Duration::from_secs(config.retry_pause_secs());
    let mut failing: Vec<String> = modules.to_vec();
    for round in 1..=MAX_ROUNDS {
        if failing.is_empty() {
            break;
        }
        if round > 1 {
            std::thread::sleep(pause);
        }
        info!(
            target: UPGRADE_TARGET,
            round,
            pending = failing.len(),
            "upgrade round starting"
        );
        let mut still_failing = Vec::new();
        for module in &failing {
            let invocation = appcmd::update_invocation(config, module, roots);
            let succeeded = match runner.run(&invocation) {
                Ok(output) => {
                    if !output.success() {
                        warn!(
                            target: UPGRADE_TARGET,
                            module = %module,
                            round,
                            stderr = output.stderr(),
                            "module update failed"
                        );
                    }
                    output.success()
                }
                Err(error) => {
                    warn!(
                        target: UPGRADE_TARGET,
                        module = %module,
                        round,
                        error = %error,
                        "module update could not be started"
                    );
                    false
                }
            };
            if !succeeded {
                still_failing.push(module.clone());
            }
        }
        failing = still_failing;
    }
    UpgradeReport {
        attempted: modules.len(),
        failed: failing,
    }
}

/// Runs the gated upgrade pass end to end.
///
/// Returns without error when upgrades are administratively disabled, no
/// build stamp is configured, another replica performed the upgrade, or the
/// persisted stamp is already current.
///
/// # Errors
///
/// Returns [`UpgradeError`] on lock failures, resolution failures, a stamp
/// that cannot be persisted, or a totally failed upgrade set.
pub fn run(
    config: &Config,
    session: &LockSession,
    store: &dyn LockStore,
    semaphores: &SemaphoreStore,
    runner: &dyn CommandRunner,
    roots: &[Utf8PathBuf],
) -> Result<(), UpgradeError> {
    if config.no_auto_upgrade() {
        info!(target: UPGRADE_TARGET, "automatic upgrade disabled, skipping");
        return Ok(());
    }
    let Some(build) = config.build_stamp() else {
        info!(target: UPGRADE_TARGET, "no build stamp configured, skipping upgrade");
        return Ok(());
    };

    let lease = Duration::from_secs(config.upgrade_lease_secs());
    if !session.acquire(UPGRADE_LOCK, lease)? {
        info!(target: UPGRADE_TARGET, "upgrade lock held elsewhere, waiting");
        store.wait(
            UPGRADE_LOCK,
            Duration::from_secs(config.lock_wait_secs()),
            Duration::from_secs(config.lock_poll_secs()),
        )?;
        info!(target: UPGRADE_TARGET, "upgrade completed by another replica");
        return Ok(());
    }

    let result = holder_pass(config, semaphores, runner, roots, build);
    if let Err(error) = session.release(UPGRADE_LOCK) {
        warn!(
            target: UPGRADE_TARGET,
            error = %error,
            "failed to release upgrade lock"
        );
    }
    result
}

fn holder_pass(
    config: &Config,
    semaphores: &SemaphoreStore,
    runner: &dyn CommandRunner,
    roots: &[Utf8PathBuf],
    build: i64,
) -> Result<(), UpgradeError> {
    let persisted = semaphores.read_stamp()?;
    if !update_needed(build, persisted) {
        info!(
            target: UPGRADE_TARGET,
            build,
            "persisted stamp already current, skipping upgrade"
        );
        return Ok(());
    }

    let filter = FilterConfig::new(&config.blocklist_patterns(), &config.languages())?;
    let modules = resolve_with_mandatory(roots, &filter, &config.mandatory_modules())?;
    if modules.is_empty() {
        info!(target: UPGRADE_TARGET, "no modules resolved, advancing stamp");
        semaphores.write_stamp(build)?;
        return Ok(());
    }

    info!(
        target: UPGRADE_TARGET,
        build,
        modules = modules.len(),
        "upgrade needed, updating modules"
    );
    let report = run_rounds(config, runner, roots, &modules);
    if report.total_failure() {
        return Err(UpgradeError::TotalFailure {
            modules: report.failed().to_vec(),
        });
    }
    if !report.failed().is_empty() {
        warn!(
            target: UPGRADE_TARGET,
            failed = ?report.failed(),
            "some modules did not upgrade; stamp advances regardless"
        );
    }
    semaphores.write_stamp(build)?;
    info!(target: UPGRADE_TARGET, build, "upgrade pass complete");
    Ok(())
}
