//! Cluster bootstrap coordinator for the managed application.
//!
//! Replicated deployments share one database, one lock store, and one
//! filesystem of module trees. This crate sequences a replica from cold
//! start to hand-off: wait for dependencies, elect a bootstrap leader,
//! provision or verify the shared state, run the gated upgrade pass, and
//! finally replace the process with the managed application.

use std::convert::Infallible;
use std::sync::Arc;

use corral_config::{Config, MarkerPaths};
use corral_locks::{LockSession, LockStore, RedisLockStore};
use corral_state::SemaphoreStore;
use tracing::info;

pub mod appcmd;
pub mod database;
pub mod exec;
pub mod orchestrator;
pub mod readiness;
pub mod telemetry;
pub mod upgrade;

pub use orchestrator::{BootError, Orchestrator};

use crate::database::DbAdmin;
use crate::exec::SystemRunner;

/// Tracing target for the top-level boot sequence.
const RUN_TARGET: &str = "corral_boot::run";

/// Runs the full boot sequence and hands off to the managed application.
///
/// Never returns on success: the process image is replaced by the managed
/// application.
///
/// # Errors
///
/// Returns [`BootError`] carrying the distinguishing exit code for the
/// failure class.
pub fn run(config: &Config, passthrough: &[String]) -> Result<Infallible, BootError> {
    let paths = MarkerPaths::from_config(config)?;
    let semaphores = SemaphoreStore::new(paths);

    let store = Arc::new(RedisLockStore::connect(
        config.lock_store_host(),
        config.lock_store_port(),
        config.lock_store_password(),
        config.lock_store_tls(),
    )?);
    let session = LockSession::new(Arc::clone(&store) as Arc<dyn LockStore>);
    session.install_signal_release()?;

    let runner = SystemRunner;
    let db = DbAdmin::new(config, &runner);
    readiness::await_dependencies(config, store.as_ref(), &db)?;

    let orchestrator = Orchestrator::new(
        config,
        &session,
        store.as_ref(),
        &semaphores,
        &runner,
        passthrough,
    );
    orchestrator.run()?;

    let roots = orchestrator.module_roots();
    upgrade::run(config, &session, store.as_ref(), &semaphores, &runner, &roots)?;

    // Nothing may remain held across the hand-off.
    session.release_all();
    let invocation = appcmd::launch_invocation(config, &roots, passthrough);
    info!(
        target: RUN_TARGET,
        program = %invocation.program(),
        "handing off to the managed application"
    );
    Err(BootError::Exec(exec::hand_off(&invocation)))
}
