//! Logging setup for tessera processes
//!
//! The runtime spreads work across many named threads: one per device stream,
//! one worker per device and the host-to-device transfer pool. Every event
//! carries the emitting thread's name so a transfer or replica launch can be
//! followed across them. Binaries, benchmarks and tests install their
//! subscriber through [`init_global_tracing`] or [`init_test_tracing`].
//!
//! Performance spans and bandwidth events use the [`PERF_TARGET`] target and
//! can be switched off independently of the rest of the output.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::str::FromStr;
use std::sync::Once;
pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Target of performance spans and transfer/launch statistics.
pub const PERF_TARGET: &str = "tessera_perf";

/// Named presets selectable through `TESSERA_TRACING_PROFILE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingProfile {
    Local,
    Ci,
    Performance,
}

impl FromStr for TracingProfile {
    type Err = TracingSetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "dev" => Ok(Self::Local),
            "ci" => Ok(Self::Ci),
            "perf" | "performance" => Ok(Self::Performance),
            other => Err(TracingSetupError::UnknownProfile(other.to_string())),
        }
    }
}

/// Formatter used for the output layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl FromStr for TracingOutput {
    type Err = TracingSetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(TracingSetupError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    #[error("unknown tracing profile '{0}' (expected local, ci or performance)")]
    UnknownProfile(String),

    #[error("unknown tracing format '{0}' (expected compact, pretty or json)")]
    UnknownFormat(String),

    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `tessera_runtime=debug`. Falls back to
    /// `RUST_LOG`, then to `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    pub output: TracingOutput,
    pub ansi: bool,
    pub include_targets: bool,
    /// Thread ids in addition to thread names.
    pub thread_ids: bool,
    pub span_events: FmtSpan,
    /// When false, everything under [`PERF_TARGET`] is filtered out.
    pub enable_performance_tracing: bool,
    /// Performance spans shorter than this are not logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    pub fn for_profile(profile: TracingProfile) -> Self {
        match profile {
            TracingProfile::Local => Self::for_local(),
            TracingProfile::Ci => Self::for_ci(),
            TracingProfile::Performance => Self::for_performance(),
        }
    }

    /// Pretty, coloured output for a terminal.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "warn,tessera_runtime=info".to_string(),
            output: TracingOutput::Pretty,
            ansi: true,
            include_targets: true,
            thread_ids: false,
            span_events: FmtSpan::NONE,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// Uncoloured JSON lines for log collection.
    pub fn for_ci() -> Self {
        Self {
            default_directive: "info".to_string(),
            output: TracingOutput::Json,
            ansi: false,
            thread_ids: true,
            enable_performance_tracing: false,
            ..Self::for_local()
        }
    }

    /// Debug-level runtime and device events, span close timings and every
    /// performance span above 50μs.
    pub fn for_performance() -> Self {
        Self {
            directives: Some(format!("info,tessera_runtime=debug,tessera_device=debug,{PERF_TARGET}=debug")),
            span_events: FmtSpan::CLOSE,
            enable_performance_tracing: true,
            performance_threshold_us: Some(50),
            ..Self::for_ci()
        }
    }

    /// Start from `TESSERA_TRACING_PROFILE` and apply overrides from
    /// `TESSERA_TRACING_DIRECTIVES`, `TESSERA_TRACING_FORMAT`,
    /// `TESSERA_PERF_TRACING` and `TESSERA_PERF_THRESHOLD_US`.
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let profile = env::var("TESSERA_TRACING_PROFILE")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(TracingProfile::Local);
        let mut config = Self::for_profile(profile);

        if let Some(directives) = non_empty_var("TESSERA_TRACING_DIRECTIVES") {
            config.directives = Some(directives);
        }
        if let Some(output) = non_empty_var("TESSERA_TRACING_FORMAT").and_then(|f| f.parse().ok()) {
            config = config.with_output(output);
        }
        if let Some(flag) = non_empty_var("TESSERA_PERF_TRACING") {
            config.enable_performance_tracing = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(threshold) = non_empty_var("TESSERA_PERF_THRESHOLD_US").and_then(|t| t.parse().ok()) {
            config.performance_threshold_us = Some(threshold);
        }
        config
    }

    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    /// JSON output never carries colour codes.
    pub fn with_output(mut self, output: TracingOutput) -> Self {
        self.output = output;
        if output == TracingOutput::Json {
            self.ansi = false;
        }
        self
    }

    pub fn with_performance_tracing(mut self, enabled: bool, threshold_us: Option<u64>) -> Self {
        self.enable_performance_tracing = enabled;
        self.performance_threshold_us = threshold_us;
        self
    }

    fn filter(&self) -> Result<EnvFilter, TracingSetupError> {
        let mut filter = match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|e| TracingSetupError::InvalidFilter(e.to_string()))?
            }
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive)),
        };
        if !self.enable_performance_tracing {
            let off = format!("{PERF_TARGET}=off")
                .parse()
                .map_err(|e: tracing_subscriber::filter::ParseError| TracingSetupError::InvalidFilter(e.to_string()))?;
            filter = filter.add_directive(off);
        }
        Ok(filter)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer(config: &TracingConfig) -> BoxedLayer {
    let base = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_thread_names(true)
        .with_thread_ids(config.thread_ids)
        .with_span_events(config.span_events.clone());
    match config.output {
        TracingOutput::Compact => Box::new(base.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(base.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(base.json().with_ansi(false)),
    }
}

/// Filter and output layer, for callers composing their own subscriber.
pub fn subscriber_layers(config: &TracingConfig) -> Result<(EnvFilter, BoxedLayer), TracingSetupError> {
    Ok((config.filter()?, output_layer(config)))
}

pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(layer).with(filter))
}

/// Install `config` as the process-wide subscriber and apply its
/// performance threshold to spans created without one.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    performance::set_default_threshold_us(config.performance_threshold_us);
    Ok(())
}

/// Compact output captured by the test harness. Only the first call in a
/// process installs anything.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_fmt()
            .compact()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_test_writer()
            .try_init();
    });
}
