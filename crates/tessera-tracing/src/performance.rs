//! Timers and statistics events for the runtime's hot paths
//!
//! Everything here is emitted under [`PERF_TARGET`](crate::PERF_TARGET), so a
//! single filter directive turns it on or off.
//!
//! ```rust
//! use tessera_tracing::performance::{record_transfer, PerformanceSpan, TransferDirection};
//!
//! let span = PerformanceSpan::new("from_host", Some(100));
//! // ... issue the copy ...
//! record_transfer(TransferDirection::HostToDevice, 4096, span.elapsed_us());
//! drop(span); // logged only if the copy took 100μs or more
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const NO_THRESHOLD: u64 = u64::MAX;

static DEFAULT_THRESHOLD_US: AtomicU64 = AtomicU64::new(NO_THRESHOLD);

/// Threshold applied to spans created without one.
pub fn set_default_threshold_us(threshold_us: Option<u64>) {
    DEFAULT_THRESHOLD_US.store(threshold_us.unwrap_or(NO_THRESHOLD), Ordering::Relaxed);
}

pub fn default_threshold_us() -> Option<u64> {
    match DEFAULT_THRESHOLD_US.load(Ordering::Relaxed) {
        NO_THRESHOLD => None,
        t => Some(t),
    }
}

/// Times a region and logs its duration when dropped.
pub struct PerformanceSpan {
    name: &'static str,
    threshold_us: Option<u64>,
    started: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// `threshold_us: None` uses the process default set by
    /// [`init_global_tracing`](crate::init_global_tracing).
    pub fn new(name: &'static str, threshold_us: Option<u64>) -> Self {
        Self::from_span(name, threshold_us, tracing::debug_span!(target: "tessera_perf", "perf", name))
    }

    /// Wrap a span built by [`perf_span!`](crate::perf_span) with extra fields.
    pub fn from_span(name: &'static str, threshold_us: Option<u64>, span: tracing::Span) -> Self {
        Self {
            name,
            threshold_us: threshold_us.or_else(default_threshold_us),
            started: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn threshold_us(&self) -> Option<u64> {
        self.threshold_us
    }

    pub fn elapsed_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.map_or(true, |t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(target: "tessera_perf", duration_us = elapsed_us, "span_complete");
        }
    }
}

/// Direction of a host↔device copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl TransferDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HostToDevice => "h2d",
            Self::DeviceToHost => "d2h",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MiB/s; zero for copies too fast to time.
pub fn bandwidth_mibps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    bytes as f64 / (1024.0 * 1024.0) / (duration_us as f64 / 1_000_000.0)
}

/// A completed host↔device copy of a whole buffer tree.
pub fn record_transfer(direction: TransferDirection, bytes: usize, duration_us: u64) {
    tracing::debug!(
        target: "tessera_perf",
        direction = direction.as_str(),
        bytes,
        duration_us,
        bandwidth_mibps = bandwidth_mibps(bytes, duration_us),
        "transfer"
    );
}

/// Device memory reserved for one buffer tree.
pub fn record_allocation(device_ordinal: usize, bytes: usize, duration_us: u64) {
    tracing::debug!(target: "tessera_perf", device_ordinal, bytes, duration_us, "allocation");
}

/// Outcome of one replicated launch, measured until every replica reported.
pub fn record_replicated_execution(replicas: usize, failed: usize, duration_us: u64) {
    tracing::debug!(target: "tessera_perf", replicas, failed, duration_us, "replicated_execution");
}
