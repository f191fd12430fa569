//! Configuration loading from files and environment.
//!
//! Sources are layered in order: each one is parsed into a document tree and
//! deep-merged over the previous ones, so a later source only needs to name
//! the keys it overrides. `COURIER_*` style environment overrides are applied
//! last, then the result is validated.

use crate::schema::CourierConfig;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A named file does not exist
    #[error("Config file {0} does not exist")]
    MissingFile(PathBuf),

    /// A file exists but could not be read
    #[error("Cannot read {path}: {source}")]
    Read {
        /// File being read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// File extension maps to no known format
    #[error("No config format for extension {0:?}")]
    UnknownExtension(String),

    /// A source is not well-formed in its format
    #[error("Malformed {format} in {origin}: {reason}")]
    Parse {
        /// File path, or "inline" for string sources
        origin: String,
        /// Format the source was parsed as
        format: Format,
        /// Parser message
        reason: String,
    },

    /// The merged document does not fit the schema
    #[error("Config does not match schema: {0}")]
    Schema(#[from] serde_json::Error),

    /// Substitution pattern failed to compile
    #[error("Invalid substitution pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Values are well-typed but out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Environment override could not be parsed
    #[error("Invalid value {value:?} for environment override {name}")]
    InvalidOverride {
        /// Environment variable name
        name: String,
        /// Rejected value
        value: String,
    },
}

/// Document format of a configuration source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// YAML
    Yaml,
    /// TOML
    Toml,
    /// JSON
    Json,
}

impl Format {
    /// Format implied by a file extension, case-insensitively
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Parse `content` into a document tree
    fn parse(self, content: &str, origin: &str) -> Result<Value, ConfigError> {
        let parsed = match self {
            Self::Yaml => serde_yaml::from_str::<Value>(content).map_err(|e| e.to_string()),
            Self::Toml => toml::from_str::<Value>(content).map_err(|e| e.to_string()),
            Self::Json => serde_json::from_str::<Value>(content).map_err(|e| e.to_string()),
        };
        match parsed {
            // Empty YAML documents are null
            Ok(Value::Null) => Ok(Value::Object(Map::new())),
            Ok(value) => Ok(value),
            Err(reason) => Err(ConfigError::Parse {
                origin: origin.to_string(),
                format: self,
                reason,
            }),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Yaml => "YAML",
            Self::Toml => "TOML",
            Self::Json => "JSON",
        })
    }
}

/// One layer of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File whose format follows its extension
    File(PathBuf),
    /// Document held in memory
    Inline(Format, String),
    /// Built-in defaults, useful as the bottom layer
    Defaults,
}

impl ConfigSource {
    /// Inline YAML document
    pub fn yaml(content: impl Into<String>) -> Self {
        Self::Inline(Format::Yaml, content.into())
    }

    /// Inline TOML document
    pub fn toml(content: impl Into<String>) -> Self {
        Self::Inline(Format::Toml, content.into())
    }

    /// Inline JSON document
    pub fn json(content: impl Into<String>) -> Self {
        Self::Inline(Format::Json, content.into())
    }

    async fn read(&self) -> Result<Value, ConfigError> {
        match self {
            Self::File(path) => read_file(path).await,
            Self::Inline(format, content) => format.parse(&substitute_env_vars(content)?, "inline"),
            Self::Defaults => Ok(serde_json::to_value(CourierConfig::default())?),
        }
    }
}

async fn read_file(path: &Path) -> Result<Value, ConfigError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let format = Format::from_extension(extension)
        .ok_or_else(|| ConfigError::UnknownExtension(extension.to_string()))?;

    let content = tokio::fs::read_to_string(path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::MissingFile(path.to_path_buf())
        } else {
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    debug!(path = %path.display(), %format, "Read configuration file");
    format.parse(&substitute_env_vars(&content)?, &path.display().to_string())
}

/// Layers sources and environment overrides into a validated [`CourierConfig`]
#[derive(Debug, Default)]
pub struct ConfigLoader {
    layers: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Loader with no layers; loading it yields the defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a layer over the ones already added
    #[must_use]
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.layers.push(source);
        self
    }

    /// Push a file layer
    #[must_use]
    pub fn with_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_source(ConfigSource::File(path.into()))
    }

    /// Read `{prefix}_*` variables as final overrides
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Merge every layer, apply overrides, then validate.
    ///
    /// # Errors
    /// Returns error if any source fails to load, an override is malformed,
    /// or the merged configuration fails validation
    pub async fn load(self) -> Result<CourierConfig, ConfigError> {
        let mut merged = Value::Object(Map::new());
        for layer in &self.layers {
            merge_values(&mut merged, layer.read().await?);
        }

        let mut config: CourierConfig = serde_json::from_value(merged)?;
        if let Some(prefix) = self.env_prefix.as_deref() {
            apply_env_overrides(&mut config, prefix)?;
        }
        config
            .validate_config()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        info!(
            layers = self.layers.len(),
            primary = %config.providers.primary.name,
            secondary = %config.providers.secondary.name,
            "Configuration loaded"
        );
        Ok(config)
    }
}

/// Recursively merge `overlay` into `base`; non-object values replace.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` references.
///
/// Unset variables without a default are left in place.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")?;
    let substituted = pattern.replace_all(content, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (std::env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                warn!(name, "Environment variable not set");
                caps[0].to_string()
            }
        }
    });
    Ok(substituted.into_owned())
}

/// Read `{prefix}_{key}` and convert it with `parse`
fn env_value<T>(
    prefix: &str,
    key: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    let name = format!("{prefix}_{key}");
    let Ok(value) = std::env::var(&name) else {
        return Ok(None);
    };
    match parse(value.trim()) {
        Some(parsed) => Ok(Some(parsed)),
        None => Err(ConfigError::InvalidOverride { name, value }),
    }
}

fn env_override<T: FromStr>(prefix: &str, key: &str) -> Result<Option<T>, ConfigError> {
    env_value(prefix, key, |raw| raw.parse().ok())
}

fn env_duration(prefix: &str, key: &str) -> Result<Option<Duration>, ConfigError> {
    env_value(prefix, key, |raw| {
        humantime_serde::re::humantime::parse_duration(raw).ok()
    })
}

fn apply_env_overrides(config: &mut CourierConfig, prefix: &str) -> Result<(), ConfigError> {
    if let Some(name) = env_override::<String>(prefix, "PRIMARY_PROVIDER")? {
        config.providers.primary.name = name;
    }
    if let Some(name) = env_override::<String>(prefix, "SECONDARY_PROVIDER")? {
        config.providers.secondary.name = name;
    }
    if let Some(attempts) = env_override(prefix, "RETRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = attempts;
    }
    if let Some(delay) = env_duration(prefix, "RETRY_INITIAL_DELAY")? {
        config.retry.initial_delay = delay;
    }
    if let Some(enabled) = env_override(prefix, "RATE_LIMIT_ENABLED")? {
        config.rate_limit.enabled = enabled;
    }
    if let Some(max) = env_override(prefix, "RATE_LIMIT_MAX_REQUESTS")? {
        config.rate_limit.max_requests = max;
    }
    if let Some(interval) = env_duration(prefix, "RATE_LIMIT_INTERVAL")? {
        config.rate_limit.interval = interval;
    }
    if let Some(concurrency) = env_override(prefix, "QUEUE_CONCURRENCY")? {
        config.queue.concurrency = concurrency;
    }
    if let Some(level) = env_override::<String>(prefix, "LOG_LEVEL")? {
        config.observability.logging.level = level;
    }
    if let Some(enabled) = env_override(prefix, "METRICS_ENABLED")? {
        config.observability.metrics.enabled = enabled;
    }
    Ok(())
}

/// Load configuration from default locations
///
/// Looks for configuration in order:
/// 1. Path from the `COURIER_CONFIG` environment variable
/// 2. ./courier.yaml, ./courier.yml, ./courier.toml
/// 3. ./config/courier.yaml
///
/// `COURIER_*` environment overrides are applied in every case.
///
/// # Errors
/// Returns error if a found file fails to parse or validate
pub async fn load_config() -> Result<CourierConfig, ConfigError> {
    let explicit = std::env::var("COURIER_CONFIG").ok();
    let search_paths: Vec<&str> = match explicit.as_deref() {
        Some(path) => vec![path],
        None => vec![
            "courier.yaml",
            "courier.yml",
            "courier.toml",
            "config/courier.yaml",
        ],
    };

    let loader = ConfigLoader::new().with_env_prefix("COURIER");
    for path in search_paths {
        if Path::new(path).exists() {
            info!(path, "Loading configuration");
            return loader.with_file(path).load().await;
        }
    }

    warn!("No configuration file found, using defaults");
    loader.with_source(ConfigSource::Defaults).load().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("COURIER_TEST_SUBST_NAME", "mailgun");

        let result = substitute_env_vars("name: ${COURIER_TEST_SUBST_NAME}").expect("substitute");
        assert_eq!(result, "name: mailgun");

        std::env::remove_var("COURIER_TEST_SUBST_NAME");
    }

    #[test]
    fn test_env_var_with_default() {
        let result =
            substitute_env_vars("ttl: ${COURIER_TEST_UNSET_TTL:-2h}").expect("substitute");
        assert_eq!(result, "ttl: 2h");
    }

    #[test]
    fn test_unset_env_var_left_in_place() {
        let result = substitute_env_vars("name: ${COURIER_TEST_NEVER_SET}").expect("substitute");
        assert_eq!(result, "name: ${COURIER_TEST_NEVER_SET}");
    }

    #[test]
    fn test_merge_values_is_deep() {
        let mut base = serde_json::json!({"retry": {"max_attempts": 3, "jitter": 0.0}, "queue": {"concurrency": 5}});
        merge_values(&mut base, serde_json::json!({"retry": {"max_attempts": 5}}));
        assert_eq!(
            base,
            serde_json::json!({"retry": {"max_attempts": 5, "jitter": 0.0}, "queue": {"concurrency": 5}})
        );
    }

    #[tokio::test]
    async fn test_load_yaml_content() {
        let yaml = r#"
providers:
  primary:
    name: sendgrid
  secondary:
    name: mailgun
retry:
  max_attempts: 5
  initial_delay: 250ms
rate_limit:
  max_requests: 10
  interval: 1s
queue:
  concurrency: 2
"#;

        let config = ConfigLoader::new()
            .with_source(ConfigSource::yaml(yaml))
            .load()
            .await
            .expect("load config");

        assert_eq!(config.providers.primary.name, "sendgrid");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, None);
        assert_eq!(config.rate_limit.interval, Duration::from_secs(1));
        assert_eq!(config.queue.concurrency, 2);
    }

    #[tokio::test]
    async fn test_later_sources_override_earlier() {
        let toml = r#"
[retry]
max_attempts = 4
max_delay = "10s"

[circuit_breaker]
failure_threshold = 2
"#;
        let json = r#"{"retry": {"initial_delay": "2s"}}"#;

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Defaults)
            .with_source(ConfigSource::toml(toml))
            .with_source(ConfigSource::json(json))
            .load()
            .await
            .expect("load config");

        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_delay, Some(Duration::from_secs(10)));
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
    }

    #[tokio::test]
    async fn test_validation_failure() {
        let result = ConfigLoader::new()
            .with_source(ConfigSource::yaml("queue:\n  concurrency: 0\n"))
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = ConfigLoader::new()
            .with_file("/nonexistent/courier.yaml")
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::MissingFile(_))));
    }

    #[tokio::test]
    async fn test_env_overrides() {
        std::env::set_var("COURIER_TEST_A_QUEUE_CONCURRENCY", "9");
        std::env::set_var("COURIER_TEST_A_RATE_LIMIT_INTERVAL", "500ms");
        std::env::set_var("COURIER_TEST_A_SECONDARY_PROVIDER", "fallback");

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Defaults)
            .with_env_prefix("COURIER_TEST_A")
            .load()
            .await
            .expect("load config");

        assert_eq!(config.queue.concurrency, 9);
        assert_eq!(config.rate_limit.interval, Duration::from_millis(500));
        assert_eq!(config.providers.secondary.name, "fallback");

        std::env::remove_var("COURIER_TEST_A_QUEUE_CONCURRENCY");
        std::env::remove_var("COURIER_TEST_A_RATE_LIMIT_INTERVAL");
        std::env::remove_var("COURIER_TEST_A_SECONDARY_PROVIDER");
    }

    #[tokio::test]
    async fn test_malformed_env_override() {
        std::env::set_var("COURIER_TEST_B_RETRY_MAX_ATTEMPTS", "many");

        let result = ConfigLoader::new()
            .with_env_prefix("COURIER_TEST_B")
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::InvalidOverride { .. })));

        std::env::remove_var("COURIER_TEST_B_RETRY_MAX_ATTEMPTS");
    }

    #[tokio::test]
    async fn test_malformed_inline_source() {
        let result = ConfigLoader::new()
            .with_source(ConfigSource::toml("[retry\nmax_attempts = 2"))
            .load()
            .await;
        assert!(matches!(
            result,
            Err(ConfigError::Parse { format: Format::Toml, ref origin, .. }) if origin == "inline"
        ));
    }

    #[tokio::test]
    async fn test_unknown_extension() {
        let result = ConfigLoader::new().with_file("courier.ini").load().await;
        assert!(matches!(result, Err(ConfigError::UnknownExtension(ext)) if ext == "ini"));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(Format::from_extension("YML"), Some(Format::Yaml));
        assert_eq!(Format::from_extension("json"), Some(Format::Json));
        assert_eq!(Format::from_extension(""), None);
    }
}
