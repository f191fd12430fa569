//! Structured logging setup.
//!
//! The subscriber is built from three layers of filtering, applied in order:
//! - `RUST_LOG` (or the configured `level` when unset) as the base filter
//! - `dispatch_level`, applied to the courier crates only
//! - explicit `directives`, which win over everything above

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Crates whose verbosity follows `dispatch_level`
const DISPATCH_TARGETS: [&str; 4] = [
    "courier_dispatch",
    "courier_providers",
    "courier_resilience",
    "courier_core",
];

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Install a subscriber at all
    pub enabled: bool,
    /// Base level for every target
    pub level: String,
    /// Level override for the courier crates (sends, retries, failover)
    pub dispatch_level: Option<String>,
    /// Output format
    pub format: LogFormat,
    /// Prefix lines with a timestamp; JSON output always carries one
    pub timestamps: bool,
    /// Record file and line of each event
    pub source_location: bool,
    /// Which span transitions produce log lines
    pub span_events: SpanEvents,
    /// Extra `target=level` directives
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            dispatch_level: None,
            format: LogFormat::default(),
            timestamps: true,
            source_location: false,
            span_events: SpanEvents::default(),
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// Logging at `level` with everything else defaulted
    #[must_use]
    pub fn at_level(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    /// Raise or lower verbosity for the courier crates only
    #[must_use]
    pub fn with_dispatch_level(mut self, level: impl Into<String>) -> Self {
        self.dispatch_level = Some(level.into());
        self
    }

    /// Append a filter directive such as `courier_resilience=trace`
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Parsed base level.
    ///
    /// # Errors
    /// Returns `LoggingError::InvalidLevel` for unknown level names
    pub fn base_level(&self) -> Result<Level, LoggingError> {
        parse_level(&self.level)
    }

    /// Directives layered over the base filter, in application order.
    ///
    /// # Errors
    /// Returns an error if a level or directive does not parse
    pub fn overrides(&self) -> Result<Vec<Directive>, LoggingError> {
        let mut out = Vec::with_capacity(DISPATCH_TARGETS.len() + self.directives.len());

        if let Some(level) = &self.dispatch_level {
            let level = LevelFilter::from_level(parse_level(level)?);
            for target in DISPATCH_TARGETS {
                out.push(parse_directive(&format!("{target}={level}"))?);
            }
        }
        for raw in self.directives.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
            out.push(parse_directive(raw)?);
        }
        Ok(out)
    }
}

fn parse_level(raw: &str) -> Result<Level, LoggingError> {
    raw.trim()
        .parse()
        .map_err(|_| LoggingError::InvalidLevel(raw.to_string()))
}

fn parse_directive(raw: &str) -> Result<Directive, LoggingError> {
    raw.parse().map_err(|e| LoggingError::InvalidDirective {
        directive: raw.to_string(),
        reason: format!("{e}"),
    })
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line, human-oriented
    #[default]
    Pretty,
    /// Single line per event
    Compact,
}

/// Span transitions to log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanEvents {
    /// None
    #[default]
    None,
    /// Creation and close, with busy/idle timings on close
    Lifecycle,
    /// Every enter and exit
    Active,
    /// All of the above
    Full,
}

impl From<SpanEvents> for FmtSpan {
    fn from(events: SpanEvents) -> Self {
        match events {
            SpanEvents::None => FmtSpan::NONE,
            SpanEvents::Lifecycle => FmtSpan::NEW | FmtSpan::CLOSE,
            SpanEvents::Active => FmtSpan::ACTIVE,
            SpanEvents::Full => FmtSpan::FULL,
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// Does nothing when logging is disabled.
///
/// # Errors
/// Returns an error if the configuration does not parse or a global
/// subscriber is already installed
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    if !config.enabled {
        return Ok(());
    }

    let filter = build_filter(config)?;
    tracing_subscriber::registry()
        .with(build_layer(config).with_filter(filter))
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    let base = LevelFilter::from_level(config.base_level()?);
    let mut filter = EnvFilter::builder()
        .with_default_directive(base.into())
        .try_from_env()
        .map_err(|e| LoggingError::InvalidDirective {
            directive: EnvFilter::DEFAULT_ENV.to_string(),
            reason: e.to_string(),
        })?;

    for directive in config.overrides()? {
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn build_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer()
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(config.span_events.into());

    match config.format {
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Pretty if config.timestamps => layer.pretty().boxed(),
        LogFormat::Pretty => layer.pretty().without_time().boxed(),
        LogFormat::Compact if config.timestamps => layer.compact().boxed(),
        LogFormat::Compact => layer.compact().without_time().boxed(),
    }
}

/// Logging setup error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Unknown level name
    #[error("Unknown log level: {0}")]
    InvalidLevel(String),

    /// A filter directive did not parse
    #[error("Invalid log directive '{directive}': {reason}")]
    InvalidDirective {
        /// The offending directive, or the variable it came from
        directive: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber was already set
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(config: &LoggingConfig) -> Vec<String> {
        config
            .overrides()
            .expect("valid overrides")
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_base_level_parsing() {
        assert_eq!(LoggingConfig::at_level("debug").base_level().unwrap(), Level::DEBUG);
        assert_eq!(LoggingConfig::at_level(" WARN ").base_level().unwrap(), Level::WARN);
        assert!(matches!(
            LoggingConfig::at_level("loud").base_level(),
            Err(LoggingError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_no_overrides_by_default() {
        assert!(rendered(&LoggingConfig::default()).is_empty());
    }

    #[test]
    fn test_dispatch_level_targets_courier_crates() {
        let config = LoggingConfig::at_level("warn").with_dispatch_level("debug");
        let directives = rendered(&config);

        assert_eq!(directives.len(), DISPATCH_TARGETS.len());
        assert!(directives.contains(&"courier_dispatch=debug".to_string()));
        assert!(directives.contains(&"courier_resilience=debug".to_string()));
    }

    #[test]
    fn test_explicit_directives_come_last() {
        let config = LoggingConfig::default()
            .with_dispatch_level("info")
            .with_directive("courier_resilience=trace")
            .with_directive("   ");
        let directives = rendered(&config);

        assert_eq!(directives.len(), DISPATCH_TARGETS.len() + 1);
        assert_eq!(directives.last().map(String::as_str), Some("courier_resilience=trace"));
    }

    #[test]
    fn test_bad_directive_rejected() {
        let config = LoggingConfig::default().with_directive("courier=[[");
        assert!(matches!(
            config.overrides(),
            Err(LoggingError::InvalidDirective { .. })
        ));

        let config = LoggingConfig::default().with_dispatch_level("chatty");
        assert!(matches!(config.overrides(), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_disabled_is_noop() {
        let config = LoggingConfig {
            enabled: false,
            level: "not-a-level".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: LoggingConfig = serde_json::from_str(
            r#"{"level":"warn","format":"compact","directives":["hyper=off"]}"#,
        )
        .expect("parse");
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.timestamps);
        assert_eq!(config.span_events, SpanEvents::None);
        assert_eq!(config.directives, vec!["hyper=off"]);
    }

    #[test]
    fn test_span_events_mapping() {
        assert_eq!(FmtSpan::from(SpanEvents::None), FmtSpan::NONE);
        assert_eq!(FmtSpan::from(SpanEvents::Active), FmtSpan::ENTER | FmtSpan::EXIT);
        assert_eq!(FmtSpan::from(SpanEvents::Full), FmtSpan::FULL);
    }
}
