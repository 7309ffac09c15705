//! Logging setup on top of `tracing-subscriber`.

use std::path::PathBuf;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{TelemetryError, TelemetryResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human friendly.
    #[default]
    Pretty,
    /// Single line, abbreviated.
    Compact,
    /// Newline-delimited JSON.
    Json,
    /// Single line with every span field.
    Full,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            "full" => Ok(Self::Full),
            other => Err(TelemetryError::ConfigError(format!(
                "unknown log format '{other}'"
            ))),
        }
    }
}

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogTarget {
    /// Standard error.
    #[default]
    Stderr,
    /// Standard output.
    Stdout,
    /// A file, created (with parent directories) if missing. Never rotated.
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level directive, e.g. `info`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Output destination.
    pub target: LogTarget,
    /// Extra `EnvFilter` directives such as `lantern_plugins=debug`.
    pub directives: Vec<String>,
    /// Honour `RUST_LOG` when it is set.
    pub respect_env: bool,
    /// Emit ANSI colour codes. Ignored for JSON and file targets.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

impl LogConfig {
    /// Create a configuration at `level` with pretty stderr output.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::Pretty,
            target: LogTarget::Stderr,
            directives: Vec::new(),
            respect_env: true,
            ansi: true,
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the output destination.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Add a filter directive.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Ignore `RUST_LOG` even when it is set.
    #[must_use]
    pub fn ignore_env(mut self) -> Self {
        self.respect_env = false;
        self
    }

    /// Enable or disable ANSI colours.
    #[must_use]
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Build a configuration from the `[logging]` config section.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ConfigError`] for an unknown format.
    #[cfg(feature = "config")]
    pub fn from_config(section: &lantern_config::LoggingSection) -> TelemetryResult<Self> {
        let mut config = Self::new(section.level.clone()).with_format(section.format.parse()?);
        config.directives.extend(section.directives.iter().cloned());
        Ok(config)
    }

    /// Build the `EnvFilter` for this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ConfigError`] if the level or any directive
    /// does not parse.
    pub fn env_filter(&self) -> TelemetryResult<EnvFilter> {
        let base = if self.respect_env && std::env::var_os("RUST_LOG").is_some() {
            EnvFilter::try_from_default_env()
                .map_err(|e| TelemetryError::ConfigError(format!("invalid RUST_LOG: {e}")))?
        } else {
            EnvFilter::try_new(&self.level).map_err(|e| {
                TelemetryError::ConfigError(format!("invalid level '{}': {e}", self.level))
            })?
        };

        self.directives.iter().try_fold(base, |filter, directive| {
            let parsed: Directive = directive.parse().map_err(|e| {
                TelemetryError::ConfigError(format!("invalid directive '{directive}': {e}"))
            })?;
            Ok(filter.add_directive(parsed))
        })
    }

    fn make_writer(&self) -> TelemetryResult<BoxMakeWriter> {
        Ok(match &self.target {
            LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogTarget::File(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map_or_else(|| PathBuf::from("."), PathBuf::from);
                let file_name = path.file_name().ok_or_else(|| {
                    TelemetryError::ConfigError(format!(
                        "log file path has no file name: {}",
                        path.display()
                    ))
                })?;
                std::fs::create_dir_all(&dir)?;
                BoxMakeWriter::new(tracing_appender::rolling::never(dir, file_name))
            },
        })
    }

    fn use_ansi(&self) -> bool {
        self.ansi && !matches!(self.target, LogTarget::File(_))
    }
}

/// Install a global subscriber built from `config`.
///
/// # Errors
///
/// Returns [`TelemetryError::ConfigError`] for bad filters or paths, and
/// [`TelemetryError::InitError`] if a global subscriber is already set.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.env_filter()?;
    let writer = config.make_writer()?;
    let ansi = config.use_ansi();
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Full => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init(),
    };

    result.map_err(|e| TelemetryError::InitError(e.to_string()))
}

/// Install an `info`-level pretty subscriber on stderr.
///
/// # Errors
///
/// See [`setup_logging`].
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::default())
}
