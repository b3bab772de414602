//! Default values applied when an option is absent from every layer.

/// Default database server host.
pub const DATABASE_HOST: &str = "postgres";

/// Default database server port.
pub const DATABASE_PORT: u16 = 5432;

/// Default database role.
pub const DATABASE_USER: &str = "corral";

/// Default database password.
pub const DATABASE_PASSWORD: &str = "corral";

/// Default database name.
pub const DATABASE_NAME: &str = "corral";

/// Default SSL mode for direct database connections.
pub const DATABASE_SSLMODE: &str = "disable";

/// Default port for the pooling intermediary when only its host is set.
pub const POOLER_PORT: u16 = 5432;

/// Default SSL mode for the pooling intermediary.
pub const POOLER_SSLMODE: &str = "disable";

/// Default lock-store host.
pub const LOCK_STORE_HOST: &str = "localhost";

/// Default lock-store port.
pub const LOCK_STORE_PORT: u16 = 6379;

/// Default supported-language list (`ll_CC` comma separated).
pub const LANGUAGES: &str = "en_AU,en_CA,en_IN,en_NZ,en_UK,en_US";

/// Modules that must always be part of an install or upgrade set.
pub const MANDATORY_MODULES: &[&str] = &["base", "web"];

/// Default directory holding the durable coordination markers.
pub const STATE_DIR: &str = "/etc/corral";

/// Default directory holding the per-database filestore trees.
pub const DATA_DIR: &str = "/var/lib/corral";

/// Default managed-application binary.
pub const APP_BINARY: &str = "/usr/bin/appd";

/// Default external restore helper.
pub const RESTORE_HELPER: &str = "/usr/local/sbin/restore";

/// Seconds to wait for external dependencies before giving up.
pub const DEPENDENCY_WAIT_SECS: u64 = 300;

/// Poll interval while waiting for external dependencies.
pub const DEPENDENCY_POLL_SECS: u64 = 5;

/// Seconds a follower waits for a contended lock to clear.
pub const LOCK_WAIT_SECS: u64 = 10_800;

/// Poll interval while waiting for a contended lock.
pub const LOCK_POLL_SECS: u64 = 10;

/// Lease applied to the bootstrap lock. Must exceed the worst-case
/// first-time provisioning duration so a live leader is never pre-empted.
pub const INIT_LEASE_SECS: u64 = 14_400;

/// Lease applied to the upgrade lock.
pub const UPGRADE_LEASE_SECS: u64 = 3_600;

/// Pause between upgrade retry rounds that still have failures.
pub const RETRY_PAUSE_SECS: u64 = 5;

/// Default log filter expression used by the binary.
pub const LOG_FILTER: &str = "info";
