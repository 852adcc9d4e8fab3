//! Configuration for the event loop binding and the built-in operations.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `max_watchers` | 4096 |
//! | `default_timeout_ms` | 5000 |
//! | `query.attempts` | 3 |
//! | `query.attempt_timeout_ms` | 2000 |
//! | `query.backoff_factor` | 2 |
//! | `query.max_response_size` | 65535 |
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: fields set directly on [`LoopConfig`]
//! 2. **Environment variables**: values from `DNSLOOP_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: [`LoopConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `DNSLOOP_MAX_WATCHERS` | `usize` | `max_watchers` |
//! | `DNSLOOP_DEFAULT_TIMEOUT_MS` | `u64` | `default_timeout_ms` |
//! | `DNSLOOP_QUERY_ATTEMPTS` | `u32` | `query.attempts` |
//! | `DNSLOOP_QUERY_ATTEMPT_TIMEOUT_MS` | `u64` | `query.attempt_timeout_ms` |
//! | `DNSLOOP_QUERY_BACKOFF_FACTOR` | `u32` | `query.backoff_factor` |
//! | `DNSLOOP_QUERY_MAX_RESPONSE_SIZE` | `usize` | `query.max_response_size` |

/// Environment variable name for the watcher slab capacity.
pub const ENV_MAX_WATCHERS: &str = "DNSLOOP_MAX_WATCHERS";
/// Environment variable name for the default operation timeout.
pub const ENV_DEFAULT_TIMEOUT_MS: &str = "DNSLOOP_DEFAULT_TIMEOUT_MS";
/// Environment variable name for the number of query attempts.
pub const ENV_QUERY_ATTEMPTS: &str = "DNSLOOP_QUERY_ATTEMPTS";
/// Environment variable name for the first attempt's timeout.
pub const ENV_QUERY_ATTEMPT_TIMEOUT_MS: &str = "DNSLOOP_QUERY_ATTEMPT_TIMEOUT_MS";
/// Environment variable name for the retransmission backoff factor.
pub const ENV_QUERY_BACKOFF_FACTOR: &str = "DNSLOOP_QUERY_BACKOFF_FACTOR";
/// Environment variable name for the receive buffer size.
pub const ENV_QUERY_MAX_RESPONSE_SIZE: &str = "DNSLOOP_QUERY_MAX_RESPONSE_SIZE";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Human description of the expected type.
        expected: &'static str,
        /// The rejected value.
        value: String,
    },
    /// A value parsed but is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    #[cfg(feature = "config-file")]
    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Retransmission settings for [`DatagramQuery`](crate::query::DatagramQuery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Total number of transmissions before giving up.
    pub attempts: u32,
    /// Timeout of the first attempt in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Each retransmission multiplies the previous attempt timeout by this
    /// factor. Must be at least 1.
    pub backoff_factor: u32,
    /// Receive buffer size for a single response datagram.
    pub max_response_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout_ms: 2000,
            backoff_factor: 2,
            max_response_size: 65535,
        }
    }
}

impl QueryConfig {
    /// Timeout for the given zero-based attempt, saturating on overflow.
    ///
    /// A `backoff_factor` of 0 that bypassed validation counts as 1.
    #[must_use]
    pub fn timeout_for_attempt(&self, attempt: u32) -> u64 {
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(attempt);
        self.attempt_timeout_ms.saturating_mul(factor)
    }
}

/// Event loop configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Maximum number of simultaneously armed watchers per binding.
    ///
    /// Arming beyond this limit fails with `MemoryError`.
    pub max_watchers: usize,
    /// Total time budget of a query built from this config. Must be non-zero.
    pub default_timeout_ms: u64,
    /// Settings for datagram queries.
    pub query: QueryConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_watchers: 4096,
            default_timeout_ms: 5000,
            query: QueryConfig::default(),
        }
    }
}

impl LoopConfig {
    /// Builds a config from defaults, an optional TOML file, and the environment.
    #[cfg(feature = "config-file")]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            let parsed = parse_toml_file(path)?;
            apply_toml_config(&mut config, &parsed);
        }
        apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from defaults and the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the loop unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_watchers == 0 {
            return Err(ConfigError::Invalid("max_watchers must be at least 1".into()));
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout_ms must be at least 1".into(),
            ));
        }
        if self.query.attempts == 0 {
            return Err(ConfigError::Invalid("query.attempts must be at least 1".into()));
        }
        if self.query.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "query.attempt_timeout_ms must be at least 1".into(),
            ));
        }
        if self.query.backoff_factor == 0 {
            return Err(ConfigError::Invalid(
                "query.backoff_factor must be at least 1".into(),
            ));
        }
        if self.query.max_response_size < 12 {
            return Err(ConfigError::Invalid(
                "query.max_response_size must hold a message header".into(),
            ));
        }
        Ok(())
    }
}

/// Apply environment variable overrides to a [`LoopConfig`].
///
/// Only variables that are set in the environment are applied.
pub fn apply_env_overrides(config: &mut LoopConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_MAX_WATCHERS) {
        config.max_watchers = parse_env(ENV_MAX_WATCHERS, &val, "unsigned integer")?;
    }
    if let Some(val) = read_env(ENV_DEFAULT_TIMEOUT_MS) {
        config.default_timeout_ms = parse_env(ENV_DEFAULT_TIMEOUT_MS, &val, "milliseconds")?;
    }
    if let Some(val) = read_env(ENV_QUERY_ATTEMPTS) {
        config.query.attempts = parse_env(ENV_QUERY_ATTEMPTS, &val, "u32")?;
    }
    if let Some(val) = read_env(ENV_QUERY_ATTEMPT_TIMEOUT_MS) {
        config.query.attempt_timeout_ms =
            parse_env(ENV_QUERY_ATTEMPT_TIMEOUT_MS, &val, "milliseconds")?;
    }
    if let Some(val) = read_env(ENV_QUERY_BACKOFF_FACTOR) {
        config.query.backoff_factor = parse_env(ENV_QUERY_BACKOFF_FACTOR, &val, "u32")?;
    }
    if let Some(val) = read_env(ENV_QUERY_MAX_RESPONSE_SIZE) {
        config.query.max_response_size =
            parse_env(ENV_QUERY_MAX_RESPONSE_SIZE, &val, "unsigned integer")?;
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_env<T: std::str::FromStr>(
    var: &'static str,
    val: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    val.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected,
        value: val.to_string(),
    })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable configuration.
///
/// ```toml
/// [eventloop]
/// max_watchers = 1024
/// default_timeout_ms = 3000
///
/// [query]
/// attempts = 4
/// attempt_timeout_ms = 500
/// backoff_factor = 2
/// max_response_size = 4096
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct LoopTomlConfig {
    /// Event loop settings.
    #[serde(default)]
    pub eventloop: EventLoopToml,
    /// Query settings.
    #[serde(default)]
    pub query: QueryToml,
}

/// `[eventloop]` section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct EventLoopToml {
    /// Watcher slab capacity.
    pub max_watchers: Option<usize>,
    /// Default operation timeout.
    pub default_timeout_ms: Option<u64>,
}

/// `[query]` section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueryToml {
    /// Number of transmissions.
    pub attempts: Option<u32>,
    /// First attempt timeout.
    pub attempt_timeout_ms: Option<u64>,
    /// Backoff multiplier.
    pub backoff_factor: Option<u32>,
    /// Receive buffer size.
    pub max_response_size: Option<usize>,
}

/// Apply a parsed TOML config; only `Some` fields override.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut LoopConfig, toml: &LoopTomlConfig) {
    if let Some(v) = toml.eventloop.max_watchers {
        config.max_watchers = v;
    }
    if let Some(v) = toml.eventloop.default_timeout_ms {
        config.default_timeout_ms = v;
    }
    if let Some(v) = toml.query.attempts {
        config.query.attempts = v;
    }
    if let Some(v) = toml.query.attempt_timeout_ms {
        config.query.attempt_timeout_ms = v;
    }
    if let Some(v) = toml.query.backoff_factor {
        config.query.backoff_factor = v;
    }
    if let Some(v) = toml.query.max_response_size {
        config.query.max_response_size = v;
    }
}

/// Parse a TOML string into a [`LoopTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<LoopTomlConfig, ConfigError> {
    Ok(toml::from_str(toml_str)?)
}

/// Read and parse a TOML file into a [`LoopTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<LoopTomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_toml_str(&content)
}
