//! Leader-elected bootstrap of the shared database and module trees.
//!
//! Every replica races for the `init` lock. The winner provisions the
//! shared state (vendored trees, database, module installs, markers) while
//! the rest wait for the lock to clear and then verify the scaffold marker
//! before starting. A follower that cannot obtain evidence of a completed
//! bootstrap never proceeds.

use std::fs;
use std::io::Write;
use std::time::Duration;

use camino::Utf8PathBuf;
use corral_config::{Config, MarkerPathsError};
use corral_locks::{INIT_LOCK, LockError, LockSession, LockStore, SessionError};
use corral_modules::{
    CatalogueError, FilterConfig, FilterError, VendorError, resolve, resolve_with_mandatory,
    sync_module_tree,
};
use corral_state::{Marker, SemaphoreStore, StateError};
use thiserror::Error;
use tracing::{info, warn};

use crate::appcmd;
use crate::database::{DbAdmin, DbError};
use crate::exec::{CommandRunner, ExecError, Invocation};
use crate::readiness::ReadinessError;
use crate::upgrade::UpgradeError;

/// Tracing target for bootstrap orchestration.
const BOOT_TARGET: &str = "corral_boot::orchestrator";

/// Fatal errors raised anywhere in the boot sequence, each carrying the
/// process exit code that distinguishes it for supervisors.
#[derive(Debug, Error)]
pub enum BootError {
    /// An external dependency stayed unreachable.
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
    /// Lock acquisition or waiting failed.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Signal-triggered lock release could not be wired up.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The state directory could not be prepared.
    #[error(transparent)]
    Markers(#[from] MarkerPathsError),
    /// A marker or stamp operation failed.
    #[error(transparent)]
    State(#[from] StateError),
    /// A database administration statement failed.
    #[error(transparent)]
    Database(#[from] DbError),
    /// Vendored module trees could not be synchronised.
    #[error(transparent)]
    Vendor(#[from] VendorError),
    /// Module roots could not be walked.
    #[error(transparent)]
    Resolve(#[from] CatalogueError),
    /// The filter configuration is invalid.
    #[error(transparent)]
    Filter(#[from] FilterError),
    /// A child process could not be spawned.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// A module install pass exited non-zero.
    #[error("module installation failed during {pass} pass: {stderr}")]
    Install {
        /// Which install pass failed.
        pass: &'static str,
        /// Standard error captured from the managed application.
        stderr: String,
    },
    /// The managed-app default configuration could not be written.
    #[error("failed to write default application configuration '{path}': {source}")]
    AppConfig {
        /// Configuration path involved.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
    /// The per-database filestore directory could not be removed.
    #[error("failed to remove filestore '{path}': {source}")]
    Filestore {
        /// Filestore directory involved.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
    /// Bootstrap finished without the scaffold marker appearing.
    #[error("scaffold marker missing after bootstrap")]
    ScaffoldMissing,
    /// The upgrade pass failed fatally.
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
}

impl BootError {
    /// Process exit code distinguishing this failure class.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Readiness(_) => 10,
            Self::Lock(_) | Self::Upgrade(UpgradeError::Lock(_)) => 11,
            Self::State(_)
            | Self::Database(_)
            | Self::Vendor(_)
            | Self::Resolve(_)
            | Self::Exec(_)
            | Self::Install { .. }
            | Self::AppConfig { .. }
            | Self::Filestore { .. } => 12,
            Self::ScaffoldMissing => 13,
            Self::Upgrade(_) => 14,
            Self::Session(_) | Self::Markers(_) | Self::Filter(_) => 15,
        }
    }
}

/// Drives the bootstrap sequence for one replica.
pub struct Orchestrator<'a> {
    config: &'a Config,
    session: &'a LockSession,
    store: &'a dyn LockStore,
    semaphores: &'a SemaphoreStore,
    runner: &'a dyn CommandRunner,
    passthrough: &'a [String],
}

impl<'a> Orchestrator<'a> {
    /// Wires the orchestrator over its collaborators.
    #[must_use]
    pub fn new(
        config: &'a Config,
        session: &'a LockSession,
        store: &'a dyn LockStore,
        semaphores: &'a SemaphoreStore,
        runner: &'a dyn CommandRunner,
        passthrough: &'a [String],
    ) -> Self {
        Self {
            config,
            session,
            store,
            semaphores,
            runner,
            passthrough,
        }
    }

    /// Module roots scanned for installs, upgrades, and the launch path.
    #[must_use]
    pub fn module_roots(&self) -> Vec<Utf8PathBuf> {
        let mut roots = self.config.core_module_roots.clone();
        for extra in &self.config.extra_module_roots {
            if !roots.contains(extra) {
                roots.push(extra.clone());
            }
        }
        roots
    }

    /// Runs leader election and whichever bootstrap path falls out of it.
    ///
    /// # Errors
    ///
    /// Returns [`BootError`] when any step fails; the `init` lock is
    /// released on every path out of this function.
    pub fn run(&self) -> Result<(), BootError> {
        info!(target: BOOT_TARGET, "electing bootstrap leader");
        let lease = Duration::from_secs(self.config.init_lease_secs());
        if self.session.acquire(INIT_LOCK, lease)? {
            info!(target: BOOT_TARGET, "elected leader, bootstrapping");
            let outcome = self.leader_bootstrap();
            if let Err(error) = self.session.release(INIT_LOCK) {
                warn!(
                    target: BOOT_TARGET,
                    error = %error,
                    "failed to release bootstrap lock"
                );
            }
            outcome?;
        } else {
            info!(target: BOOT_TARGET, "bootstrap led elsewhere, following");
            self.follower_wait()?;
        }
        if !self.semaphores.exists(Marker::Scaffold) {
            return Err(BootError::ScaffoldMissing);
        }
        info!(target: BOOT_TARGET, "bootstrap complete, replica ready");
        Ok(())
    }

    fn follower_wait(&self) -> Result<(), BootError> {
        self.store.wait(
            INIT_LOCK,
            Duration::from_secs(self.config.lock_wait_secs()),
            Duration::from_secs(self.config.lock_poll_secs()),
        )?;
        // The leader may have failed; the terminal scaffold check decides.
        Ok(())
    }

    fn leader_bootstrap(&self) -> Result<(), BootError> {
        self.sync_vendor_trees()?;
        self.write_default_app_config()?;

        if self.semaphores.exists(Marker::Destroy) {
            info!(target: BOOT_TARGET, "destroy requested, re-provisioning");
            self.destroy()?;
        }
        if self.semaphores.exists(Marker::Scaffold) {
            info!(target: BOOT_TARGET, "scaffold present, nothing to provision");
            return Ok(());
        }

        if self.attempt_restore()? {
            self.regenerate_assets()?;
            self.semaphores.touch(Marker::Scaffold)?;
            return Ok(());
        }

        // Restore failed or was unavailable; clear any partial state first.
        self.destroy()?;
        self.fresh_initialise()
    }

    /// Tears down the shared state so provisioning can start clean.
    ///
    /// Safe to run against a database that does not exist, so retrying a
    /// failed bootstrap converges instead of compounding.
    ///
    /// # Errors
    ///
    /// Returns [`BootError`] when a statement or marker operation fails.
    pub fn destroy(&self) -> Result<(), BootError> {
        let database = self.config.database_name();
        let db = DbAdmin::new(self.config, self.runner);
        db.terminate_sessions(database)?;
        db.drop_database(database)?;
        db.create_database(database)?;
        self.semaphores.remove(Marker::Destroy)?;
        self.semaphores.remove(Marker::Scaffold)?;

        let filestore = self.config.filestore_dir();
        match fs::remove_dir_all(&filestore) {
            Ok(()) => info!(target: BOOT_TARGET, path = %filestore, "filestore removed"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(BootError::Filestore {
                    path: filestore,
                    source,
                });
            }
        }
        Ok(())
    }

    fn fresh_initialise(&self) -> Result<(), BootError> {
        let filter = self.filter()?;
        let core = resolve_with_mandatory(
            &self.config.core_module_roots,
            &filter,
            &self.config.mandatory_modules(),
        )?;
        self.install_pass("core", &core)?;

        let extras = resolve(&self.config.extra_module_roots, &filter)?;
        if !extras.is_empty() {
            self.install_pass("extras", &extras)?;
        }

        self.semaphores.touch(Marker::Scaffold)?;
        if let Some(build) = self.config.build_stamp() {
            self.semaphores.write_stamp(build)?;
        }
        info!(target: BOOT_TARGET, "fresh initialisation complete");
        Ok(())
    }

    fn install_pass(&self, pass: &'static str, modules: &[String]) -> Result<(), BootError> {
        if modules.is_empty() {
            return Ok(());
        }
        info!(
            target: BOOT_TARGET,
            pass,
            modules = modules.len(),
            "installing modules"
        );
        let roots = self.module_roots();
        let invocation =
            appcmd::install_invocation(self.config, modules, &roots, self.passthrough);
        let output = self.runner.run(&invocation)?;
        if output.success() {
            Ok(())
        } else {
            // A half-installed database is unusable; clear it before failing.
            let stderr = output.stderr().to_owned();
            if let Err(error) = self.destroy() {
                warn!(
                    target: BOOT_TARGET,
                    error = %error,
                    "cleanup after failed install also failed"
                );
            }
            Err(BootError::Install { pass, stderr })
        }
    }

    /// Runs the external restore helper when one is present.
    ///
    /// Returns `Ok(true)` when the helper restored a database.
    fn attempt_restore(&self) -> Result<bool, BootError> {
        let helper = self.config.restore_helper();
        if !helper.as_std_path().is_file() {
            info!(target: BOOT_TARGET, helper = %helper, "no restore helper, skipping");
            return Ok(false);
        }
        info!(target: BOOT_TARGET, helper = %helper, "attempting restore");
        let invocation = Invocation::new(helper)
            .arg(self.config.database_name())
            .env("PGPASSWORD", self.config.database_password());
        match self.runner.run(&invocation) {
            Ok(output) if output.success() => Ok(true),
            Ok(output) => {
                warn!(
                    target: BOOT_TARGET,
                    stderr = output.stderr(),
                    "restore helper failed, falling back to fresh initialise"
                );
                Ok(false)
            }
            Err(error) => {
                warn!(
                    target: BOOT_TARGET,
                    error = %error,
                    "restore helper could not be started, falling back"
                );
                Ok(false)
            }
        }
    }

    /// Rebuilds web assets after a restore by updating the last mandatory
    /// module, which owns the asset pipeline.
    fn regenerate_assets(&self) -> Result<(), BootError> {
        let mandatory = self.config.mandatory_modules();
        let Some(module) = mandatory.last() else {
            return Ok(());
        };
        info!(target: BOOT_TARGET, module = %module, "regenerating assets");
        let roots = self.module_roots();
        let invocation = appcmd::update_invocation(self.config, module, &roots);
        let output = self.runner.run(&invocation)?;
        if output.success() {
            Ok(())
        } else {
            Err(BootError::Install {
                pass: "asset regeneration",
                stderr: output.stderr().to_owned(),
            })
        }
    }

    fn sync_vendor_trees(&self) -> Result<(), BootError> {
        let (Some(source), Some(target)) = (
            self.config.vendor_source_root.as_ref(),
            self.config.vendor_target_root.as_ref(),
        ) else {
            return Ok(());
        };
        let report = sync_module_tree(source, target)?;
        info!(
            target: BOOT_TARGET,
            copied = report.copied,
            updated = report.updated,
            unchanged = report.unchanged,
            "vendored module trees synchronised"
        );
        Ok(())
    }

    /// Writes a minimal application configuration file when none exists.
    fn write_default_app_config(&self) -> Result<(), BootError> {
        let path = self.config.app_config_path();
        if path.as_std_path().exists() {
            return Ok(());
        }
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let into_error = |source| BootError::AppConfig {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(parent).map_err(into_error)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(into_error)?;
        writeln!(temp, "[options]").map_err(into_error)?;
        temp.persist(&path).map_err(|error| BootError::AppConfig {
            path: path.clone(),
            source: error.error,
        })?;
        info!(target: BOOT_TARGET, path = %path, "default application configuration written");
        Ok(())
    }

    fn filter(&self) -> Result<FilterConfig, BootError> {
        Ok(FilterConfig::new(
            &self.config.blocklist_patterns(),
            &self.config.languages(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use corral_config::MarkerPaths;

    use super::*;
    use crate::exec::CommandOutput;

    /// Lock store with scripted election outcomes.
    #[derive(Default)]
    struct FakeStore {
        keys: Mutex<HashSet<String>>,
        deny_acquire: bool,
    }

    impl LockStore for FakeStore {
        fn acquire(&self, name: &str, _lease: Duration) -> Result<bool, LockError> {
            if self.deny_acquire {
                return Ok(false);
            }
            Ok(self.keys.lock().expect("keys poisoned").insert(name.to_owned()))
        }

        fn wait(&self, name: &str, _deadline: Duration, _poll: Duration) -> Result<(), LockError> {
            if self.keys.lock().expect("keys poisoned").contains(name) {
                Err(LockError::WaitTimeout {
                    name: name.to_owned(),
                    waited_secs: 0,
                })
            } else {
                Ok(())
            }
        }

        fn release(&self, name: &str) -> Result<(), LockError> {
            self.keys.lock().expect("keys poisoned").remove(name);
            Ok(())
        }

        fn ping(&self) -> Result<(), LockError> {
            Ok(())
        }
    }

    /// Runner recording invocations; fails those whose argv carries the
    /// configured marker string.
    #[derive(Default)]
    struct ScriptedRunner {
        seen: Mutex<Vec<Invocation>>,
        fail_containing: Option<&'static str>,
    }

    impl ScriptedRunner {
        fn invocations_containing(&self, needle: &str) -> usize {
            self.seen
                .lock()
                .expect("seen poisoned")
                .iter()
                .filter(|invocation| {
                    invocation.argv().iter().any(|arg| arg.contains(needle))
                })
                .count()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
            self.seen.lock().expect("seen poisoned").push(invocation.clone());
            let fails = self
                .fail_containing
                .is_some_and(|needle| invocation.argv().iter().any(|arg| arg.contains(needle)));
            if fails {
                Ok(CommandOutput::new(false, "scripted failure"))
            } else {
                Ok(CommandOutput::new(true, ""))
            }
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        config: Config,
        store: Arc<FakeStore>,
        session: Arc<LockSession>,
        semaphores: SemaphoreStore,
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    fn harness_with(deny_acquire: bool) -> Harness {
        let temp = tempfile::tempdir().expect("create temp dir");
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .expect("temp dir should be utf-8");
        let config = Config {
            state_dir: Some(base.join("state")),
            data_dir: Some(base.join("data")),
            app_config_path: Some(base.join("state").join("app.conf")),
            restore_helper: Some(base.join("missing-restore-helper")),
            build_stamp: Some(7),
            lock_wait_secs: Some(1),
            lock_poll_secs: Some(1),
            ..Config::default()
        };
        let paths = MarkerPaths::from_config(&config).expect("derive marker paths");
        let semaphores = SemaphoreStore::new(paths);
        let store = Arc::new(FakeStore {
            deny_acquire,
            ..FakeStore::default()
        });
        let session = LockSession::new(Arc::clone(&store) as Arc<dyn corral_locks::LockStore>);
        Harness {
            _temp: temp,
            config,
            store,
            session,
            semaphores,
        }
    }

    fn orchestrator<'a>(harness: &'a Harness, runner: &'a ScriptedRunner) -> Orchestrator<'a> {
        Orchestrator::new(
            &harness.config,
            &harness.session,
            harness.store.as_ref(),
            &harness.semaphores,
            runner,
            &[],
        )
    }

    #[test]
    fn leader_provisions_and_sets_scaffold() {
        let harness = harness();
        let runner = ScriptedRunner::default();
        orchestrator(&harness, &runner).run().expect("bootstrap");

        assert!(harness.semaphores.exists(Marker::Scaffold));
        assert_eq!(
            harness.semaphores.read_stamp().expect("read stamp"),
            corral_state::Stamp::Value(7)
        );
        assert_eq!(runner.invocations_containing("--install"), 1);
        assert!(
            !harness
                .store
                .keys
                .lock()
                .expect("keys poisoned")
                .contains(INIT_LOCK),
            "bootstrap lock released"
        );
        assert!(
            harness
                .config
                .app_config_path()
                .as_std_path()
                .is_file(),
            "default application configuration written"
        );
    }

    #[test]
    fn destroy_is_idempotent() {
        let harness = harness();
        let runner = ScriptedRunner::default();
        let orchestrator = orchestrator(&harness, &runner);

        harness.semaphores.touch(Marker::Destroy).expect("set destroy");
        std::fs::create_dir_all(harness.config.filestore_dir()).expect("seed filestore");

        orchestrator.destroy().expect("first destroy");
        orchestrator.destroy().expect("second destroy with nothing left");

        assert!(!harness.semaphores.exists(Marker::Destroy));
        assert!(!harness.config.filestore_dir().as_std_path().exists());
        assert_eq!(runner.invocations_containing("DROP DATABASE"), 2);
        assert_eq!(runner.invocations_containing("CREATE DATABASE"), 2);
    }

    #[test]
    fn destroy_marker_triggers_reprovision() {
        let harness = harness();
        harness.semaphores.touch(Marker::Scaffold).expect("seed scaffold");
        harness.semaphores.touch(Marker::Destroy).expect("request destroy");

        let runner = ScriptedRunner::default();
        orchestrator(&harness, &runner).run().expect("bootstrap");

        assert!(!harness.semaphores.exists(Marker::Destroy));
        assert!(harness.semaphores.exists(Marker::Scaffold));
        assert_eq!(runner.invocations_containing("DROP DATABASE"), 2);
        assert_eq!(runner.invocations_containing("--install"), 1);
    }

    #[test]
    fn failed_install_destroys_and_fails() {
        let harness = harness();
        let runner = ScriptedRunner {
            fail_containing: Some("--install"),
            ..ScriptedRunner::default()
        };
        let error = orchestrator(&harness, &runner)
            .run()
            .expect_err("bootstrap must fail");

        assert_eq!(error.exit_code(), 12);
        assert!(!harness.semaphores.exists(Marker::Scaffold));
        assert!(
            runner.invocations_containing("DROP DATABASE") >= 2,
            "cleanup destroy ran after the failed install"
        );
    }

    #[test]
    fn follower_without_scaffold_evidence_fails() {
        // Election is lost and the lock clears without a scaffold marker
        // ever appearing, as after a crashed leader.
        let harness = harness_with(true);
        let runner = ScriptedRunner::default();
        let error = orchestrator(&harness, &runner)
            .run()
            .expect_err("follower must not proceed");
        assert!(matches!(error, BootError::ScaffoldMissing));
        assert_eq!(error.exit_code(), 13);
        assert_eq!(runner.invocations_containing("--install"), 0);
    }

    #[test]
    fn follower_proceeds_once_scaffold_exists() {
        let harness = harness_with(true);
        harness.semaphores.touch(Marker::Scaffold).expect("leader scaffolded");

        let runner = ScriptedRunner::default();
        orchestrator(&harness, &runner).run().expect("follower ready");
        assert_eq!(runner.invocations_containing("--install"), 0);
    }

    #[test]
    fn scaffolded_leader_skips_provisioning() {
        let harness = harness();
        harness.semaphores.touch(Marker::Scaffold).expect("seed scaffold");

        let runner = ScriptedRunner::default();
        orchestrator(&harness, &runner).run().expect("bootstrap");

        assert_eq!(runner.invocations_containing("--install"), 0);
        assert_eq!(runner.invocations_containing("DROP DATABASE"), 0);
    }
}
