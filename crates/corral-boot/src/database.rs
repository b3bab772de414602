//! Database administration through the `psql` client.
//!
//! Provisioning needs a handful of statements against the maintenance
//! database and the shipped client binary is always present alongside the
//! managed application, so the admin surface shells out instead of carrying
//! a driver stack of its own.

use corral_config::Config;
use thiserror::Error;
use tracing::{debug, info};

use crate::exec::{CommandRunner, ExecError, Invocation};

/// Tracing target for database administration.
const DATABASE_TARGET: &str = "corral_boot::database";

/// Maintenance database every server accepts administrative connections on.
const MAINTENANCE_DATABASE: &str = "postgres";

/// Errors raised by database administration.
#[derive(Debug, Error)]
pub enum DbError {
    /// The client binary could not be spawned.
    #[error(transparent)]
    Spawn(#[from] ExecError),
    /// The client ran but the statement failed.
    #[error("database statement failed ({action}): {stderr}")]
    Statement {
        /// What was being attempted.
        action: &'static str,
        /// Standard error captured from the client.
        stderr: String,
    },
}

/// Administrative operations against the database server.
pub struct DbAdmin<'a> {
    config: &'a Config,
    runner: &'a dyn CommandRunner,
}

impl<'a> DbAdmin<'a> {
    /// Builds an admin surface over the given runner.
    #[must_use]
    pub fn new(config: &'a Config, runner: &'a dyn CommandRunner) -> Self {
        Self { config, runner }
    }

    /// Verifies the server answers trivial queries.
    ///
    /// Readiness checks go through the runtime endpoint so a configured
    /// pooling intermediary is exercised too.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the server is unreachable or refuses the
    /// connection.
    pub fn ping(&self) -> Result<(), DbError> {
        let endpoint = self.config.database_endpoint();
        let invocation = self
            .statement_at(endpoint.host, endpoint.port, endpoint.sslmode, "SELECT 1")
            .arg("--dbname")
            .arg(MAINTENANCE_DATABASE);
        self.execute(invocation, "ping")
    }

    /// Disconnects every session attached to the database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the statement fails.
    pub fn terminate_sessions(&self, database: &str) -> Result<(), DbError> {
        let sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{database}' AND pid <> pg_backend_pid()"
        );
        let invocation = self
            .direct_statement(&sql)
            .arg("--dbname")
            .arg(MAINTENANCE_DATABASE);
        self.execute(invocation, "terminate sessions")
    }

    /// Drops the database, forcing out any lingering sessions.
    ///
    /// Dropping an absent database is tolerated so a destroy pass stays
    /// idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the statement fails for any other reason.
    pub fn drop_database(&self, database: &str) -> Result<(), DbError> {
        let sql = format!("DROP DATABASE IF EXISTS \"{database}\" WITH (FORCE)");
        let invocation = self
            .direct_statement(&sql)
            .arg("--dbname")
            .arg(MAINTENANCE_DATABASE);
        info!(target: DATABASE_TARGET, database, "dropping database");
        self.execute(invocation, "drop database")
    }

    /// Creates the database owned by the configured role.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the statement fails.
    pub fn create_database(&self, database: &str) -> Result<(), DbError> {
        let sql = format!(
            "CREATE DATABASE \"{database}\" OWNER \"{owner}\"",
            owner = self.config.database_user()
        );
        let invocation = self
            .direct_statement(&sql)
            .arg("--dbname")
            .arg(MAINTENANCE_DATABASE);
        info!(target: DATABASE_TARGET, database, "creating database");
        self.execute(invocation, "create database")
    }

    fn direct_statement(&self, sql: &str) -> Invocation {
        self.statement_at(
            self.config.database_host(),
            self.config.database_port(),
            self.config.database_sslmode(),
            sql,
        )
    }

    fn statement_at(&self, host: &str, port: u16, sslmode: &str, sql: &str) -> Invocation {
        Invocation::new("psql")
            .arg("--host")
            .arg(host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--username")
            .arg(self.config.database_user())
            .arg("--no-psqlrc")
            .arg("--quiet")
            .arg("--set")
            .arg("ON_ERROR_STOP=1")
            .arg("--command")
            .arg(sql)
            .env("PGPASSWORD", self.config.database_password())
            .env("PGSSLMODE", sslmode)
            .env("PGCONNECT_TIMEOUT", "10")
    }

    fn execute(&self, invocation: Invocation, action: &'static str) -> Result<(), DbError> {
        debug!(target: DATABASE_TARGET, action, "running database statement");
        let output = self.runner.run(&invocation)?;
        if output.success() {
            Ok(())
        } else {
            Err(DbError::Statement {
                action,
                stderr: output.stderr().to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::exec::CommandOutput;

    /// Runner that records invocations and replays scripted outcomes.
    #[derive(Default)]
    struct ScriptedRunner {
        seen: Mutex<Vec<Invocation>>,
        fail_with: Option<&'static str>,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
            self.seen.lock().expect("seen poisoned").push(invocation.clone());
            match self.fail_with {
                Some(stderr) => Ok(CommandOutput::new(false, stderr)),
                None => Ok(CommandOutput::new(true, "")),
            }
        }
    }

    #[test]
    fn ping_targets_the_runtime_endpoint() {
        let config = Config {
            pooler_host: Some("pool.internal".into()),
            ..Config::default()
        };
        let runner = ScriptedRunner::default();
        DbAdmin::new(&config, &runner).ping().expect("ping");

        let seen = runner.seen.lock().expect("seen poisoned");
        let invocation = seen.first().expect("one invocation");
        assert!(invocation.argv().contains(&"pool.internal".to_owned()));
    }

    #[test]
    fn admin_statements_bypass_the_pooler() {
        let config = Config {
            database_host: Some("db.internal".into()),
            pooler_host: Some("pool.internal".into()),
            ..Config::default()
        };
        let runner = ScriptedRunner::default();
        DbAdmin::new(&config, &runner)
            .drop_database("corral")
            .expect("drop");

        let seen = runner.seen.lock().expect("seen poisoned");
        let invocation = seen.first().expect("one invocation");
        assert!(invocation.argv().contains(&"db.internal".to_owned()));
        assert!(!invocation.argv().contains(&"pool.internal".to_owned()));
    }

    #[test]
    fn statement_failure_carries_stderr() {
        let config = Config::default();
        let runner = ScriptedRunner {
            fail_with: Some("FATAL: role does not exist"),
            ..ScriptedRunner::default()
        };
        let error = DbAdmin::new(&config, &runner)
            .create_database("corral")
            .expect_err("must fail");
        match error {
            DbError::Statement { stderr, .. } => {
                assert!(stderr.contains("role does not exist"));
            }
            DbError::Spawn(_) => panic!("unexpected spawn error"),
        }
    }

    #[test]
    fn password_travels_in_the_environment_not_argv() {
        let config = Config {
            database_password: Some("hunter2".into()),
            ..Config::default()
        };
        let runner = ScriptedRunner::default();
        DbAdmin::new(&config, &runner).ping().expect("ping");

        let seen = runner.seen.lock().expect("seen poisoned");
        let invocation = seen.first().expect("one invocation");
        assert!(!invocation.argv().iter().any(|arg| arg.contains("hunter2")));
        assert!(invocation
            .environment()
            .contains(&("PGPASSWORD".to_owned(), "hunter2".to_owned())));
    }
}
