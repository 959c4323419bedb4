//! Logging setup for the harness binaries.
//!
//! Console output always goes to stderr: stdout carries command data (port
//! tables, probe JSON, `ready:` milestones) that callers parse.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Console and file line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Pretty,
    Json,
    #[default]
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// What [`init_logging`] installs.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Daily-rotated copy of the log, written without colour.
    pub file: Option<PathBuf>,
    /// Extra `target=level` directives, e.g. `campus_harness::supervisor=trace`.
    pub directives: Vec<String>,
}

impl LogConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::default(),
            file: None,
            directives: Vec::new(),
        }
    }

    /// `CAMPUS_LOG_LEVEL`, `CAMPUS_LOG_FORMAT`, `CAMPUS_LOG_FILE` and
    /// `CAMPUS_LOG_TARGETS` over `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_lookup(default_level, |name| std::env::var(name).ok())
    }

    fn from_lookup<F>(default_level: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let mut config = Self::new(non_empty("CAMPUS_LOG_LEVEL").unwrap_or_else(|| default_level.to_string()));
        if let Some(format) = non_empty("CAMPUS_LOG_FORMAT").and_then(|v| LogFormat::parse(&v)) {
            config.format = format;
        }
        config.file = non_empty("CAMPUS_LOG_FILE").map(PathBuf::from);
        if let Some(targets) = non_empty("CAMPUS_LOG_TARGETS") {
            config.directives = targets
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }

    /// Filter directive string; `RUST_LOG` replaces it entirely when set.
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.level.as_str())
            .chain(self.directives.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(rust_log) = std::env::var("RUST_LOG")
            && !rust_log.trim().is_empty()
        {
            return EnvFilter::try_new(&rust_log).with_context(|| format!("invalid RUST_LOG '{rust_log}'"));
        }
        let directives = self.filter_directives();
        EnvFilter::try_new(&directives).with_context(|| format!("invalid log filter '{directives}'"))
    }
}

/// Keeps the file writer flushing until dropped.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. A second call leaves the first one in place.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    if tracing::dispatcher::has_been_set() {
        return Ok(LoggingGuards { _file: None });
    }

    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.format)];
    let mut file_guard = None;
    if let Some(path) = &config.file {
        let (layer, guard) = file_layer(path, config.format);
        layers.push(layer);
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LoggingGuards { _file: file_guard })
}

fn console_layer(format: LogFormat) -> BoxedLayer {
    let layer = fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat) -> (BoxedLayer, tracing_appender::non_blocking::WorkerGuard) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "campus-harness.log".to_string());
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));

    let layer = fmt::layer().with_writer(writer).with_ansi(false);
    let layer = match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty | LogFormat::Compact => layer.compact().boxed(),
    };
    (layer, guard)
}
