//! Process configuration from the environment.
//!
//! All configuration is resolved once at startup into an immutable
//! `Config` shared by reference. No component mutates it afterwards.

use std::path::PathBuf;

use thiserror::Error;

/// Value of `STAGE` that selects the local test database host.
pub const STAGE_TESTING: &str = "TESTING";

/// Stable DNS alias of the document database in a deployed cluster.
pub const DB_ALIAS: &str = "rethinkdb";

/// Errors raised while resolving the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PORT value: {0}")]
    InvalidPort(String),
}

/// Immutable daemon configuration.
///
/// Flags follow the convention that `"YES"` enables and anything else
/// (including absence) disables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment stage (`TESTING` selects local endpoints).
    pub stage: String,
    /// Log level override (`DEBUG`, `WARNING`, `ERROR`; default info).
    pub loglevel: String,
    /// Port advertised for this daemon's own plugin, if any.
    pub port: Option<u16>,
    /// Plugin name this process runs under, if any.
    pub plugin: Option<String>,
    /// Image tag suffix for plugin services.
    pub tag: String,
    /// Create the `Harness-5000` service at startup.
    pub start_harness: bool,
    /// Create the `AuxiliaryServices` service at startup.
    pub start_aux: bool,
    /// Directory holding the embedded store.
    pub data_dir: PathBuf,
    /// Orchestrator API endpoint (`host:port`).
    pub docker_host: String,
}

impl Default for Config {
    fn default() -> Self {
        // Same shape an empty environment resolves to.
        Self {
            stage: String::new(),
            loglevel: String::new(),
            port: None,
            plugin: None,
            tag: "latest".to_string(),
            start_harness: false,
            start_aux: false,
            data_dir: PathBuf::from("/var/lib/tether"),
            docker_host: "127.0.0.1:2375".to_string(),
        }
    }
}

impl Config {
    /// Resolve the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match lookup("PORT") {
            Some(raw) => Some(raw.parse::<u16>().map_err(|_| ConfigError::InvalidPort(raw))?),
            None => None,
        };

        Ok(Self {
            stage: lookup("STAGE").unwrap_or_default(),
            loglevel: lookup("LOGLEVEL").unwrap_or_default(),
            port,
            plugin: lookup("PLUGIN"),
            tag: lookup("TAG").unwrap_or_else(|| "latest".to_string()),
            start_harness: lookup("START_HARNESS").as_deref() == Some("YES"),
            start_aux: lookup("START_AUX").as_deref() == Some("YES"),
            data_dir: lookup("TETHER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/tether")),
            docker_host: lookup("DOCKER_HOST")
                .map(|h| h.trim_start_matches("tcp://").to_string())
                .unwrap_or_else(|| "127.0.0.1:2375".to_string()),
        })
    }

    /// Host the document database is reachable at.
    ///
    /// `STAGE == "TESTING"` selects the loopback address; every other
    /// stage uses the cluster-internal alias.
    pub fn db_host(&self) -> &str {
        if self.stage == STAGE_TESTING {
            "127.0.0.1"
        } else {
            DB_ALIAS
        }
    }

    /// Default tracing directive derived from `LOGLEVEL`.
    ///
    /// Only consulted when `RUST_LOG` is unset.
    pub fn log_directive(&self) -> &'static str {
        match self.loglevel.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" => "error",
            _ => "info",
        }
    }
}
