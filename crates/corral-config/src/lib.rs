//! Shared configuration surface for the corral bootstrap coordinator.
//!
//! Every recognised option can arrive from the command line, the
//! environment (prefix `CORRAL_`), or a configuration file; the layers are
//! merged with command-line values winning. Options are stored as they were
//! supplied and defaults are applied by the accessor methods, so callers
//! always observe a fully resolved value.

mod defaults;
mod logging;
mod markers;

use std::ffi::OsString;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};

pub use logging::{LogFormat, LogFormatParseError};
pub use markers::{MarkerPaths, MarkerPathsError};

/// Options recognised by the coordinator.
///
/// All fields are optional so absent layers merge cleanly; use the accessor
/// methods to obtain defaulted values.
#[derive(Clone, Debug, Default, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "CORRAL")]
pub struct Config {
    /// Database server host for direct connections.
    pub database_host: Option<String>,
    /// Database server port for direct connections.
    pub database_port: Option<u16>,
    /// Database role used for administration and the managed application.
    pub database_user: Option<String>,
    /// Password for the database role.
    pub database_password: Option<String>,
    /// Name of the shared database.
    pub database_name: Option<String>,
    /// SSL mode for direct database connections (`disable`, `require`, ...).
    pub database_sslmode: Option<String>,
    /// Host of the optional pooling intermediary. When set, runtime
    /// connections are routed through it instead of the database host.
    pub pooler_host: Option<String>,
    /// Port of the pooling intermediary.
    pub pooler_port: Option<u16>,
    /// SSL mode for the pooling intermediary.
    pub pooler_sslmode: Option<String>,

    /// Lock-store host.
    pub lock_store_host: Option<String>,
    /// Lock-store port.
    pub lock_store_port: Option<u16>,
    /// Lock-store password, when authentication is enabled.
    pub lock_store_password: Option<String>,
    /// Whether to reach the lock store over TLS.
    pub lock_store_tls: Option<bool>,

    /// Supported languages as a comma-separated `ll_CC` list.
    pub languages: Option<String>,
    /// Module exclusion patterns (regular expressions, comma or whitespace
    /// separated).
    pub module_blocklist: Option<String>,
    /// Modules force-included in every install and upgrade set.
    #[serde(default)]
    pub mandatory_modules: Vec<String>,
    /// Roots scanned for core modules during the first install pass.
    #[serde(default)]
    pub core_module_roots: Vec<Utf8PathBuf>,
    /// Roots scanned for secondary modules during the extras pass.
    #[serde(default)]
    pub extra_module_roots: Vec<Utf8PathBuf>,
    /// Root holding pristine vendored module trees shipped with the image.
    pub vendor_source_root: Option<Utf8PathBuf>,
    /// Root the vendored trees are synchronised into before installation.
    pub vendor_target_root: Option<Utf8PathBuf>,

    /// Build stamp baked in at image build time; drives upgrade gating.
    pub build_stamp: Option<i64>,
    /// Administratively disables the automatic upgrade pass.
    pub no_auto_upgrade: Option<bool>,

    /// Managed-application binary invoked for installs, upgrades and launch.
    pub app_binary: Option<Utf8PathBuf>,
    /// Configuration file handed to the managed application.
    pub app_config_path: Option<Utf8PathBuf>,
    /// Directory holding the per-database filestore trees.
    pub data_dir: Option<Utf8PathBuf>,
    /// Directory holding the durable coordination markers.
    pub state_dir: Option<Utf8PathBuf>,
    /// External helper attempted before falling back to a fresh initialise.
    pub restore_helper: Option<Utf8PathBuf>,
    /// Suppresses demonstration data during installs.
    pub without_demo: Option<bool>,

    /// Seconds to wait for external dependencies before giving up.
    pub dependency_wait_secs: Option<u64>,
    /// Poll interval while waiting for external dependencies.
    pub dependency_poll_secs: Option<u64>,
    /// Seconds a follower waits for a contended lock to clear.
    pub lock_wait_secs: Option<u64>,
    /// Poll interval while waiting for a contended lock.
    pub lock_poll_secs: Option<u64>,
    /// Lease in seconds applied to the bootstrap lock.
    pub init_lease_secs: Option<u64>,
    /// Lease in seconds applied to the upgrade lock.
    pub upgrade_lease_secs: Option<u64>,
    /// Pause between upgrade retry rounds that still have failures.
    pub retry_pause_secs: Option<u64>,

    /// Log filter expression (`tracing` env-filter syntax).
    pub log_filter: Option<String>,
    /// Log output format.
    pub log_format: Option<LogFormat>,
}

impl Config {
    /// Loads configuration from the process environment and arguments.
    ///
    /// # Errors
    ///
    /// Propagates the aggregated loader error when any layer is malformed.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        <Self as OrthoConfig>::load()
    }

    /// Loads configuration from an explicit argument iterator.
    ///
    /// # Errors
    ///
    /// Propagates the aggregated loader error when any layer is malformed.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as OrthoConfig>::load_from_iter(args)
    }

    /// Database server host for direct connections.
    #[must_use]
    pub fn database_host(&self) -> &str {
        self.database_host.as_deref().unwrap_or(defaults::DATABASE_HOST)
    }

    /// Database server port for direct connections.
    #[must_use]
    pub fn database_port(&self) -> u16 {
        self.database_port.unwrap_or(defaults::DATABASE_PORT)
    }

    /// Database role name.
    #[must_use]
    pub fn database_user(&self) -> &str {
        self.database_user.as_deref().unwrap_or(defaults::DATABASE_USER)
    }

    /// Password for the database role.
    #[must_use]
    pub fn database_password(&self) -> &str {
        self.database_password
            .as_deref()
            .unwrap_or(defaults::DATABASE_PASSWORD)
    }

    /// Name of the shared database.
    #[must_use]
    pub fn database_name(&self) -> &str {
        self.database_name.as_deref().unwrap_or(defaults::DATABASE_NAME)
    }

    /// SSL mode for direct database connections.
    #[must_use]
    pub fn database_sslmode(&self) -> &str {
        self.database_sslmode
            .as_deref()
            .unwrap_or(defaults::DATABASE_SSLMODE)
    }

    /// Endpoint runtime connections should use, honouring the pooling
    /// intermediary when one is configured.
    #[must_use]
    pub fn database_endpoint(&self) -> DatabaseEndpoint<'_> {
        match self.pooler_host.as_deref() {
            Some(host) => DatabaseEndpoint {
                host,
                port: self.pooler_port.unwrap_or(defaults::POOLER_PORT),
                sslmode: self
                    .pooler_sslmode
                    .as_deref()
                    .unwrap_or(defaults::POOLER_SSLMODE),
                pooled: true,
            },
            None => DatabaseEndpoint {
                host: self.database_host(),
                port: self.database_port(),
                sslmode: self.database_sslmode(),
                pooled: false,
            },
        }
    }

    /// Lock-store host.
    #[must_use]
    pub fn lock_store_host(&self) -> &str {
        self.lock_store_host
            .as_deref()
            .unwrap_or(defaults::LOCK_STORE_HOST)
    }

    /// Lock-store port.
    #[must_use]
    pub fn lock_store_port(&self) -> u16 {
        self.lock_store_port.unwrap_or(defaults::LOCK_STORE_PORT)
    }

    /// Lock-store password, when authentication is enabled.
    #[must_use]
    pub fn lock_store_password(&self) -> Option<&str> {
        self.lock_store_password.as_deref()
    }

    /// Whether to reach the lock store over TLS.
    #[must_use]
    pub fn lock_store_tls(&self) -> bool {
        self.lock_store_tls.unwrap_or(false)
    }

    /// Supported languages in declaration order.
    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        self.languages
            .as_deref()
            .unwrap_or(defaults::LANGUAGES)
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Module exclusion patterns. Commas and whitespace both separate
    /// entries, matching the historical operator-facing syntax.
    #[must_use]
    pub fn blocklist_patterns(&self) -> Vec<String> {
        self.module_blocklist
            .as_deref()
            .unwrap_or_default()
            .replace(',', " ")
            .split_whitespace()
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Modules force-included in every install and upgrade set.
    #[must_use]
    pub fn mandatory_modules(&self) -> Vec<String> {
        if self.mandatory_modules.is_empty() {
            defaults::MANDATORY_MODULES
                .iter()
                .map(|name| (*name).to_owned())
                .collect()
        } else {
            self.mandatory_modules.clone()
        }
    }

    /// Build stamp baked in at image build time, when present.
    #[must_use]
    pub fn build_stamp(&self) -> Option<i64> {
        self.build_stamp
    }

    /// Whether the automatic upgrade pass is administratively disabled.
    #[must_use]
    pub fn no_auto_upgrade(&self) -> bool {
        self.no_auto_upgrade.unwrap_or(false)
    }

    /// Managed-application binary path.
    #[must_use]
    pub fn app_binary(&self) -> &Utf8Path {
        self.app_binary
            .as_deref()
            .unwrap_or(Utf8Path::new(defaults::APP_BINARY))
    }

    /// Configuration file handed to the managed application.
    #[must_use]
    pub fn app_config_path(&self) -> Utf8PathBuf {
        self.app_config_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("app.conf"))
    }

    /// Directory holding the per-database filestore trees.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        self.data_dir
            .as_deref()
            .unwrap_or(Utf8Path::new(defaults::DATA_DIR))
    }

    /// Filestore directory for the configured database.
    #[must_use]
    pub fn filestore_dir(&self) -> Utf8PathBuf {
        self.data_dir().join("filestore").join(self.database_name())
    }

    /// Directory holding the durable coordination markers.
    #[must_use]
    pub fn state_dir(&self) -> &Utf8Path {
        self.state_dir
            .as_deref()
            .unwrap_or(Utf8Path::new(defaults::STATE_DIR))
    }

    /// External restore helper path.
    #[must_use]
    pub fn restore_helper(&self) -> &Utf8Path {
        self.restore_helper
            .as_deref()
            .unwrap_or(Utf8Path::new(defaults::RESTORE_HELPER))
    }

    /// Whether demonstration data is suppressed during installs.
    #[must_use]
    pub fn without_demo(&self) -> bool {
        self.without_demo.unwrap_or(true)
    }

    /// Seconds to wait for external dependencies before giving up.
    #[must_use]
    pub fn dependency_wait_secs(&self) -> u64 {
        self.dependency_wait_secs
            .unwrap_or(defaults::DEPENDENCY_WAIT_SECS)
    }

    /// Poll interval while waiting for external dependencies.
    #[must_use]
    pub fn dependency_poll_secs(&self) -> u64 {
        self.dependency_poll_secs
            .unwrap_or(defaults::DEPENDENCY_POLL_SECS)
    }

    /// Seconds a follower waits for a contended lock to clear.
    #[must_use]
    pub fn lock_wait_secs(&self) -> u64 {
        self.lock_wait_secs.unwrap_or(defaults::LOCK_WAIT_SECS)
    }

    /// Poll interval while waiting for a contended lock.
    #[must_use]
    pub fn lock_poll_secs(&self) -> u64 {
        self.lock_poll_secs.unwrap_or(defaults::LOCK_POLL_SECS)
    }

    /// Lease in seconds applied to the bootstrap lock.
    #[must_use]
    pub fn init_lease_secs(&self) -> u64 {
        self.init_lease_secs.unwrap_or(defaults::INIT_LEASE_SECS)
    }

    /// Lease in seconds applied to the upgrade lock.
    #[must_use]
    pub fn upgrade_lease_secs(&self) -> u64 {
        self.upgrade_lease_secs
            .unwrap_or(defaults::UPGRADE_LEASE_SECS)
    }

    /// Pause between upgrade retry rounds that still have failures.
    #[must_use]
    pub fn retry_pause_secs(&self) -> u64 {
        self.retry_pause_secs.unwrap_or(defaults::RETRY_PAUSE_SECS)
    }

    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(defaults::LOG_FILTER)
    }

    /// Log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_default()
    }
}

/// Resolved database endpoint for runtime connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseEndpoint<'a> {
    /// Host to connect to.
    pub host: &'a str,
    /// Port to connect to.
    pub port: u16,
    /// SSL mode for the connection.
    pub sslmode: &'a str,
    /// Whether the endpoint is the pooling intermediary.
    pub pooled: bool,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_cover_every_accessor() {
        let config = Config::default();
        assert_eq!(config.database_host(), "postgres");
        assert_eq!(config.database_port(), 5432);
        assert_eq!(config.database_name(), "corral");
        assert_eq!(config.lock_store_host(), "localhost");
        assert_eq!(config.lock_store_port(), 6379);
        assert!(!config.lock_store_tls());
        assert!(!config.no_auto_upgrade());
        assert!(config.without_demo());
        assert_eq!(config.mandatory_modules(), vec!["base", "web"]);
        assert_eq!(config.log_filter(), "info");
        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.filestore_dir(), "/var/lib/corral/filestore/corral");
    }

    #[test]
    fn pooler_host_takes_precedence_for_runtime_endpoint() {
        let config = Config {
            database_host: Some("db.internal".into()),
            database_port: Some(5433),
            pooler_host: Some("pool.internal".into()),
            pooler_sslmode: Some("require".into()),
            ..Config::default()
        };
        let endpoint = config.database_endpoint();
        assert!(endpoint.pooled);
        assert_eq!(endpoint.host, "pool.internal");
        assert_eq!(endpoint.port, 5432);
        assert_eq!(endpoint.sslmode, "require");
    }

    #[test]
    fn direct_endpoint_used_without_pooler() {
        let config = Config {
            database_host: Some("db.internal".into()),
            database_port: Some(5433),
            ..Config::default()
        };
        let endpoint = config.database_endpoint();
        assert!(!endpoint.pooled);
        assert_eq!(endpoint.host, "db.internal");
        assert_eq!(endpoint.port, 5433);
    }

    #[rstest]
    #[case::commas("a,b,c", vec!["a", "b", "c"])]
    #[case::whitespace("a b\tc", vec!["a", "b", "c"])]
    #[case::mixed("a, b  c", vec!["a", "b", "c"])]
    #[case::empty("", Vec::<&str>::new())]
    fn blocklist_accepts_comma_and_whitespace_separators(
        #[case] raw: &str,
        #[case] expected: Vec<&str>,
    ) {
        let config = Config {
            module_blocklist: Some(raw.into()),
            ..Config::default()
        };
        assert_eq!(config.blocklist_patterns(), expected);
    }

    #[test]
    fn languages_default_to_english_variants() {
        let config = Config::default();
        let languages = config.languages();
        assert_eq!(languages.first().map(String::as_str), Some("en_AU"));
        assert_eq!(languages.len(), 6);
    }
}
