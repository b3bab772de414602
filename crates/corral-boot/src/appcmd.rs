//! Composes managed-application invocations.
//!
//! All argument assembly goes through a structured options map: caller
//! overrides are parsed into the map first and defaults are merged only for
//! keys still absent, so an operator-supplied flag always wins without any
//! string scanning of the final argument vector.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use corral_config::Config;

use crate::exec::Invocation;

#[derive(Debug, Clone, PartialEq, Eq)]
enum OptionValue {
    Flag,
    Value(String),
}

/// Structured options map feeding an application invocation.
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    options: BTreeMap<String, OptionValue>,
    positional: Vec<String>,
}

impl AppOptions {
    /// Parses caller-supplied passthrough arguments into the map.
    ///
    /// Recognised shapes are `--key=value`, `--key value`, and bare
    /// `--key` flags; anything else is kept as a positional argument.
    #[must_use]
    pub fn from_passthrough(args: &[String]) -> Self {
        let mut options = Self::default();
        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            let Some(stripped) = arg.strip_prefix("--") else {
                options.positional.push(arg.clone());
                continue;
            };
            if let Some((key, value)) = stripped.split_once('=') {
                options
                    .options
                    .insert(key.to_owned(), OptionValue::Value(value.to_owned()));
            } else if let Some(next) = iter.peek().filter(|next| !next.starts_with("--")) {
                options
                    .options
                    .insert(stripped.to_owned(), OptionValue::Value((*next).clone()));
                iter.next();
            } else {
                options.options.insert(stripped.to_owned(), OptionValue::Flag);
            }
        }
        options
    }

    /// Sets an option unconditionally.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.options
            .insert(key.to_owned(), OptionValue::Value(value.into()));
    }

    /// Sets a bare flag unconditionally.
    pub fn set_flag(&mut self, key: &str) {
        self.options.insert(key.to_owned(), OptionValue::Flag);
    }

    /// Sets an option only when the key is still absent.
    pub fn default_value(&mut self, key: &str, value: impl Into<String>) {
        self.options
            .entry(key.to_owned())
            .or_insert_with(|| OptionValue::Value(value.into()));
    }

    /// Sets a bare flag only when the key is still absent.
    pub fn default_flag(&mut self, key: &str) {
        self.options.entry(key.to_owned()).or_insert(OptionValue::Flag);
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// Renders the map into a deterministic argument vector.
    #[must_use]
    pub fn into_args(self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.options.len() * 2 + self.positional.len());
        for (key, value) in self.options {
            match value {
                OptionValue::Flag => args.push(format!("--{key}")),
                OptionValue::Value(value) => {
                    args.push(format!("--{key}"));
                    args.push(value);
                }
            }
        }
        args.extend(self.positional);
        args
    }
}

/// Worker count for the managed application: `max(1, 2 x CPU - 1)`.
#[must_use]
pub fn worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    (2 * cpus).saturating_sub(1).max(1)
}

fn direct_connection_defaults(options: &mut AppOptions, config: &Config) {
    options.default_value("db-host", config.database_host());
    options.default_value("db-port", config.database_port().to_string());
    options.default_value("db-sslmode", config.database_sslmode());
    connection_identity_defaults(options, config);
}

fn runtime_connection_defaults(options: &mut AppOptions, config: &Config) {
    let endpoint = config.database_endpoint();
    options.default_value("db-host", endpoint.host);
    options.default_value("db-port", endpoint.port.to_string());
    options.default_value("db-sslmode", endpoint.sslmode);
    connection_identity_defaults(options, config);
}

fn connection_identity_defaults(options: &mut AppOptions, config: &Config) {
    options.default_value("db-user", config.database_user());
    options.default_value("db-password", config.database_password());
    options.default_value("database", config.database_name());
    options.default_value("config", config.app_config_path());
    options.default_value("data-dir", config.data_dir().to_string());
}

fn modules_path(roots: &[Utf8PathBuf]) -> String {
    roots
        .iter()
        .map(|root| root.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// One-shot invocation installing the given modules.
///
/// Installs run against the database host directly, suppress demonstration
/// data when configured, load the language list, and stop after
/// initialisation without opening network listeners.
#[must_use]
pub fn install_invocation(
    config: &Config,
    modules: &[String],
    roots: &[Utf8PathBuf],
    passthrough: &[String],
) -> Invocation {
    let mut options = AppOptions::from_passthrough(passthrough);
    options.set("install", modules.join(","));
    options.set_flag("stop-after-init");
    options.set_flag("no-listeners");
    if config.without_demo() {
        options.default_flag("without-demo");
    }
    options.default_value("load-language", config.languages().join(","));
    options.default_value("modules-path", modules_path(roots));
    direct_connection_defaults(&mut options, config);
    Invocation::new(config.app_binary()).args(options.into_args())
}

/// One-shot invocation updating a single module.
#[must_use]
pub fn update_invocation(config: &Config, module: &str, roots: &[Utf8PathBuf]) -> Invocation {
    let mut options = AppOptions::default();
    options.set("update", module);
    options.set_flag("stop-after-init");
    options.set_flag("no-listeners");
    options.default_value("modules-path", modules_path(roots));
    direct_connection_defaults(&mut options, config);
    Invocation::new(config.app_binary()).args(options.into_args())
}

/// Final long-running invocation the bootstrapper hands off to.
///
/// Runtime connections honour the pooling intermediary; the HTTP interface
/// binds dual-stack and the worker count follows the host CPU count unless
/// overridden by the caller.
#[must_use]
pub fn launch_invocation(
    config: &Config,
    roots: &[Utf8PathBuf],
    passthrough: &[String],
) -> Invocation {
    let mut options = AppOptions::from_passthrough(passthrough);
    options.default_value("workers", worker_count().to_string());
    options.default_value("http-interface", "::");
    options.default_value("load-language", config.languages().join(","));
    options.default_value("modules-path", modules_path(roots));
    runtime_connection_defaults(&mut options, config);
    Invocation::new(config.app_binary()).args(options.into_args())
}
