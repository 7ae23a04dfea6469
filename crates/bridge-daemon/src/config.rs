//! Daemon configuration.
//!
//! Loads a TOML file (default `/etc/bridge-daemon/config.toml`, overridable
//! via `BRIDGE_CONFIG`) with every section optional — missing sections and
//! missing fields fall back to sane defaults. `BRIDGE_API_KEY` is handled
//! separately by [`crate::startup`] since it is not a config value but a
//! one-shot credential import.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level daemon configuration, merged from TOML plus environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub keystore: KeystoreSection,
    pub matrix: MatrixSection,
    pub budget: BudgetSection,
    pub security: SecuritySection,
    pub webrtc: WebrtcSection,
    pub logging: LoggingSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            keystore: KeystoreSection::default(),
            matrix: MatrixSection::default(),
            budget: BudgetSection::default(),
            security: SecuritySection::default(),
            webrtc: WebrtcSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

/// `[server]` — control socket and process lifecycle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Directory holding the control socket, seed file, and pid file.
    pub runtime_dir: PathBuf,
    /// Control socket path, relative to `runtime_dir` if not absolute.
    pub socket_path: PathBuf,
    /// Whether to daemonize (fork to background). Not implemented on
    /// non-Unix platforms.
    pub daemonize: bool,
    /// Optional pid file path, relative to `runtime_dir` if not absolute.
    pub pid_file: Option<PathBuf>,
    /// TTL sweep interval, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/var/run/bridge-daemon"),
            socket_path: PathBuf::from("bridge.sock"),
            daemonize: false,
            pid_file: None,
            sweep_interval_secs: bridge_core::ttl::DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

/// `[keystore]` — encrypted credential store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeystoreSection {
    /// Storage backend for the keystore: `memory` or `rocksdb`.
    pub backend: String,
    /// Path to the RocksDB directory (ignored for `memory`).
    pub db_path: PathBuf,
    /// Seed file path, relative to `runtime_dir` if not absolute.
    pub seed_path: Option<PathBuf>,
    /// Extra context salt mixed into master-key derivation, beyond the
    /// application-fixed context string.
    pub key_derivation_context: Option<String>,
}

impl Default for KeystoreSection {
    fn default() -> Self {
        Self {
            backend: "rocksdb".to_owned(),
            db_path: PathBuf::from("/var/lib/bridge-daemon/keystore"),
            seed_path: None,
            key_derivation_context: None,
        }
    }
}

/// `[matrix]` — optional Matrix homeserver connection for the event sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatrixSection {
    pub enabled: bool,
    pub homeserver_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MatrixSection {
    fn default() -> Self {
        Self {
            enabled: false,
            homeserver_url: None,
            username: None,
            password: None,
        }
    }
}

/// `[budget]` — default token/duration budget policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    /// Fraction of the limit at which the one-shot warning fires.
    pub warning_threshold: f64,
    /// Whether crossing the hard limit closes the session.
    pub hard_stop: bool,
    /// Default token limit applied when `session.create` doesn't specify one.
    pub default_token_limit: u64,
    /// Default wall-clock duration limit (seconds) applied when
    /// `session.create` doesn't specify one.
    pub default_duration_limit_secs: i64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        let policy = bridge_core::budget::BudgetPolicy::default();
        Self {
            warning_threshold: policy.warning_threshold,
            hard_stop: policy.hard_stop,
            default_token_limit: 100_000,
            default_duration_limit_secs: 3600,
        }
    }
}

/// `[security]` — admission control policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub max_concurrent_calls: u64,
    pub rate_limit_calls: u64,
    pub rate_limit_window_secs: i64,
    pub bucket_idle_eviction_secs: i64,
    pub allow_principals: Vec<String>,
    pub block_principals: Vec<String>,
    pub allow_rooms: Vec<String>,
    pub block_rooms: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        let policy = bridge_core::security::SecurityPolicy::default();
        Self {
            max_concurrent_calls: policy.max_concurrent_calls,
            rate_limit_calls: policy.rate_limit_max,
            rate_limit_window_secs: policy.rate_limit_window.num_seconds(),
            bucket_idle_eviction_secs: policy.bucket_idle_eviction.num_seconds(),
            allow_principals: Vec::new(),
            block_principals: Vec::new(),
            allow_rooms: Vec::new(),
            block_rooms: Vec::new(),
        }
    }
}

/// `[webrtc]` — TURN credential minting and signaling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebrtcSection {
    /// Shared secret for the TURN REST API time-limited-credential scheme.
    /// If empty, a random per-process secret is drawn (TURN credentials
    /// remain valid only for the lifetime of this process).
    pub turn_shared_secret: String,
    pub turn_servers: Vec<String>,
    pub signaling_endpoint: Option<String>,
    pub default_turn_ttl_secs: i64,
}

impl Default for WebrtcSection {
    fn default() -> Self {
        Self {
            turn_shared_secret: String::new(),
            turn_servers: Vec::new(),
            signaling_endpoint: None,
            default_turn_ttl_secs: bridge_core::turn::DEFAULT_TURN_TTL_SECS,
        }
    }
}

/// `[logging]` — structured logging sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level filter (e.g. `info`, `debug`, `warn`).
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "json".to_owned(),
        }
    }
}

impl Config {
    /// Load configuration: start from defaults, overlay the TOML file named
    /// by `BRIDGE_CONFIG` (falling back to `/etc/bridge-daemon/config.toml`
    /// if that default happens to exist, otherwise pure defaults).
    ///
    /// # Errors
    ///
    /// Returns an error if `BRIDGE_CONFIG` names a file that cannot be read
    /// or does not parse as valid TOML for this schema.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = std::env::var("BRIDGE_CONFIG").ok();
        let path = explicit
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/bridge-daemon/config.toml"));

        let config = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("failed to parse config file '{}': {e}", path.display()))?,
            Err(_) if explicit.is_none() => Self::default(),
            Err(e) => {
                return Err(anyhow::anyhow!("failed to read config file '{}': {e}", path.display()));
            }
        };

        Ok(config)
    }

    /// Resolve `path` against `runtime_dir` if it isn't already absolute.
    #[must_use]
    pub fn resolve_runtime_path(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.server.runtime_dir.join(path)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert!(config.budget.hard_stop);
        assert!(!config.server.socket_path.as_os_str().is_empty());
    }

    #[test]
    fn resolve_runtime_path_joins_relative_paths() {
        let mut config = Config::default();
        config.server.runtime_dir = PathBuf::from("/var/run/bridge-daemon");

        let resolved = config.resolve_runtime_path(std::path::Path::new("bridge.sock"));
        assert_eq!(resolved, PathBuf::from("/var/run/bridge-daemon/bridge.sock"));

        let absolute = config.resolve_runtime_path(std::path::Path::new("/tmp/other.sock"));
        assert_eq!(absolute, PathBuf::from("/tmp/other.sock"));
    }

    #[test]
    fn parses_partial_toml_with_fallback_defaults() {
        let toml_str = r#"
            [budget]
            default_token_limit = 5000

            [security]
            max_concurrent_calls = 10
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.budget.default_token_limit, 5000);
        assert_eq!(config.security.max_concurrent_calls, 10);
        // Untouched sections keep their defaults.
        assert_eq!(config.logging.level, "info");
    }
}
