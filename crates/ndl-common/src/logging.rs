//! Logging setup
//!
//! Every NDL binary logs through `tracing`. [`init_logging`] installs a global subscriber
//! that writes text or JSON lines to stdout, to a daily-rotated file, or to both, filtered
//! by a base level plus optional `EnvFilter` directives (e.g. `sqlx=warn,reqwest=info`).
//!
//! Prefer structured fields over formatted strings for anything worth searching on:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! # let ticker = "AAPL";
//! info!(table = "SHARADAR/SF1", rows = 1000, "Fetched page");
//! warn!(ticker = %ticker, field = "pe_ratio", "Value overflows column; writing NULL");
//! ```
//!
//! ```no_run
//! use ndl_common::logging::{init_logging, LogConfig};
//! use tracing::Level;
//!
//! # fn main() -> ndl_common::Result<()> {
//! let config = LogConfig::for_binary("ndl-ingest")
//!     .with_level(Level::DEBUG)
//!     .merge_env()?;
//! // Dropping the guard flushes buffered file output.
//! let _guard = init_logging(&config)?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::env;
use crate::error::{CommonError, Result};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    /// Daily rolling file under `log_dir`
    File,
    Both,
}

impl LogOutput {
    fn writes_console(self) -> bool {
        self != LogOutput::File
    }

    fn writes_file(self) -> bool {
        self != LogOutput::Console
    }
}

impl FromStr for LogOutput {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(Self::Console),
            "file" => Ok(Self::File),
            "both" => Ok(Self::Both),
            other => Err(CommonError::config(format!(
                "LOG_OUTPUT must be console, file or both, got {other:?}"
            ))),
        }
    }
}

/// Line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else if s.eq_ignore_ascii_case("text") {
            Ok(Self::Text)
        } else {
            Err(CommonError::config(format!(
                "LOG_FORMAT must be text or json, got {s:?}"
            )))
        }
    }
}

/// Subscriber settings; see [`LogConfig::merge_env`] for the variables that override them
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    pub log_dir: PathBuf,
    /// Rotated files are named `{prefix}.{YYYY-MM-DD}`
    pub log_file_prefix: String,
    /// Extra `EnvFilter` directives, comma separated
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::for_binary("ndl")
    }
}

impl LogConfig {
    /// Console text at INFO, with files (if enabled) prefixed by `name`
    pub fn for_binary(name: impl Into<String>) -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: name.into(),
            filter_directives: None,
            include_location: false,
            include_targets: true,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_filter(mut self, directives: impl Into<String>) -> Self {
        self.filter_directives = Some(directives.into());
        self
    }

    pub fn with_output(mut self, output: LogOutput, log_dir: impl Into<PathBuf>) -> Self {
        self.output = output;
        self.log_dir = log_dir.into();
        self
    }

    /// Defaults overlaid with the environment
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Apply any of `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE_PREFIX`,
    /// `LOG_FILTER`, `LOG_INCLUDE_LOCATION` and `LOG_INCLUDE_TARGETS` that are set.
    pub fn merge_env(mut self) -> Result<Self> {
        self.level = env::parse_or("LOG_LEVEL", self.level)?;
        self.output = env::parse_or("LOG_OUTPUT", self.output)?;
        self.format = env::parse_or("LOG_FORMAT", self.format)?;
        self.log_dir = env::parse_or("LOG_DIR", self.log_dir)?;
        self.log_file_prefix = env::string_or("LOG_FILE_PREFIX", &self.log_file_prefix);
        // LOG_FILTER extends the binary's own directives; later directives win.
        if let Ok(extra) = std::env::var("LOG_FILTER") {
            self.filter_directives = Some(match self.filter_directives.take() {
                Some(base) => format!("{base},{extra}"),
                None => extra,
            });
        }
        self.include_location = env::parse_or("LOG_INCLUDE_LOCATION", self.include_location)?;
        self.include_targets = env::parse_or("LOG_INCLUDE_TARGETS", self.include_targets)?;
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());

        let directives = self.filter_directives.as_deref().unwrap_or_default();
        for directive in env::split_list(directives) {
            let parsed = directive.parse().map_err(|e| {
                CommonError::Logging(format!("invalid filter directive {directive:?}: {e}"))
            })?;
            filter = filter.add_directive(parsed);
        }

        Ok(filter)
    }
}

/// Install the global subscriber.
///
/// With file output the non-blocking writer's guard is returned and must outlive all
/// logging; without it the result is `None`.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = config.env_filter()?;
    let mut layers = Vec::with_capacity(2);
    let mut guard = None;

    if config.output.writes_console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if config.output.writes_file() {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| CommonError::Logging(e.to_string()))?;

    Ok(guard)
}

fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
