//! Tracing subscriber setup for the command-line tool
//!
//! Library code only emits `tracing` and `log` events; installing a subscriber
//! is left to binaries, which call [`TracingConfig::init`] once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output format of the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Colored compact output (default)
    Console,
    /// Uncolored compact output for CI logs
    Compact,
    /// One JSON object per event, for log shippers
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Where events go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracingOutput {
    /// stderr
    Console,
    /// A log file (never rotated)
    #[cfg(feature = "tracing-files")]
    File(std::path::PathBuf),
    /// stderr plus a daily-rotated log file
    #[cfg(feature = "tracing-files")]
    Both(std::path::PathBuf),
}

/// Keeps background log writers alive; drop it only at exit
#[derive(Debug, Default)]
pub struct TracingGuard {
    #[cfg(feature = "tracing-files")]
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

#[derive(Debug)]
pub struct TracingConfig {
    /// `-v` count
    pub verbosity: u8,
    pub format: TracingFormat,
    pub output: TracingOutput,
    /// Explicit filter directive, wins over verbosity
    pub env_filter: Option<String>,
    /// Correlation id logged once at startup
    pub session_id: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            format: TracingFormat::Console,
            output: TracingOutput::Console,
            env_filter: None,
            session_id: None,
        }
    }
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: TracingOutput) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Filter directive for the verbosity level
    ///
    /// Dependencies stay at `warn` below `-vvv` so HTTP and runtime internals
    /// do not drown the pipeline's own events.
    #[must_use]
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn,museum_cutout=info",
            1 => "warn,museum_cutout=debug",
            2 => "warn,museum_cutout=trace",
            _ => "trace",
        }
    }

    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let directive = match &self.env_filter {
            Some(filter) => filter.as_str(),
            None => self.verbosity_to_filter(),
        };
        Ok(EnvFilter::try_new(directive)?)
    }

    /// Install the global subscriber
    ///
    /// # Errors
    /// - Invalid filter directive
    /// - A global subscriber is already installed
    pub fn init(self) -> anyhow::Result<TracingGuard> {
        use tracing_subscriber::fmt;

        let registry = Registry::default().with(self.filter()?);
        #[allow(unused_mut)]
        let mut guard = TracingGuard::default();

        match (&self.format, &self.output) {
            (TracingFormat::Console, TracingOutput::Console) => {
                let layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(false)
                    .with_level(true)
                    .compact();
                registry.with(layer).try_init()?;
            },
            (TracingFormat::Compact, TracingOutput::Console) => {
                let layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(false)
                    .compact();
                registry.with(layer).try_init()?;
            },
            #[cfg(feature = "tracing-json")]
            (TracingFormat::Json, TracingOutput::Console) => {
                let layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(true)
                    .with_span_list(true);
                registry.with(layer).try_init()?;
            },
            #[cfg(feature = "tracing-files")]
            (_, TracingOutput::File(path)) => {
                use tracing_appender::{non_blocking, rolling};

                let appender = rolling::never(
                    path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                    path.file_name()
                        .unwrap_or_else(|| std::ffi::OsStr::new("museum-cutout.log")),
                );
                let (writer, file_guard) = non_blocking(appender);
                guard._file = Some(file_guard);
                let layer = fmt::layer().with_ansi(false).with_writer(writer).compact();
                registry.with(layer).try_init()?;
            },
            #[cfg(feature = "tracing-files")]
            (format, TracingOutput::Both(path)) => {
                use tracing_appender::{non_blocking, rolling};

                let ansi = matches!(format, TracingFormat::Console);
                let console = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(ansi)
                    .with_target(false)
                    .compact();
                let appender = rolling::daily(
                    path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                    path.file_stem()
                        .unwrap_or_else(|| std::ffi::OsStr::new("museum-cutout")),
                );
                let (writer, file_guard) = non_blocking(appender);
                guard._file = Some(file_guard);
                let file = fmt::layer().with_ansi(false).with_writer(writer).compact();
                registry.with(console).with(file).try_init()?;
            },
        }

        if let Some(session_id) = &self.session_id {
            tracing::debug!(session_id = %session_id, "Cutout session started");
        }
        Ok(guard)
    }
}

/// Subscriber with CLI defaults: console format, `RUST_LOG` over `-v`
///
/// # Errors
/// - See [`TracingConfig::init`]
pub fn init_cli_tracing(verbosity: u8, session_id: &str) -> anyhow::Result<TracingGuard> {
    let mut config = TracingConfig::new()
        .with_verbosity(verbosity)
        .with_session_id(session_id);
    if let Ok(filter) = std::env::var("RUST_LOG") {
        if !filter.trim().is_empty() {
            config = config.with_env_filter(filter);
        }
    }
    config.init()
}

/// Spans shared by the binary
pub mod spans {
    use tracing::{Level, Span};

    /// One CLI or event invocation
    pub fn invocation(session_id: &str, segmenter: &str, source: &str) -> Span {
        tracing::span!(
            Level::INFO,
            "invocation",
            session_id = %session_id,
            segmenter = %segmenter,
            source = %source
        )
    }

    /// Model load ahead of the first request
    pub fn model_loading(segmenter: &str, backend: &str) -> Span {
        tracing::span!(
            Level::INFO,
            "model_loading",
            segmenter = %segmenter,
            backend = %backend
        )
    }
}
