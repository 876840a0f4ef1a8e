use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::registry::ScrubReport;

/// Metrics interface allowing pluggable sinks (default: no-op).
pub trait CaptureMetrics: Send + Sync {
    /// A warning was converted into a record by an active capture.
    fn record_captured(&self) {}
    /// A drain returned `count` records.
    fn record_flushed(&self, _count: usize) {}
    /// End-of-test replay re-emitted `count` records, `failures` of which raised.
    fn record_replayed(&self, _count: usize, _failures: usize) {}
    /// A registry scrub finished.
    fn record_scrub(&self, _report: &ScrubReport) {}
    /// A panic was caught at the FFI boundary.
    fn record_panic(&self, _label: &'static str) {}
}

struct NoopMetrics;

impl CaptureMetrics for NoopMetrics {}

static METRICS_SINK: Lazy<RwLock<Arc<dyn CaptureMetrics>>> =
    Lazy::new(|| RwLock::new(Arc::new(NoopMetrics)));

fn metrics_sink() -> Arc<dyn CaptureMetrics> {
    METRICS_SINK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Install a metrics sink, returning the one it replaces.
pub fn install_metrics(metrics: Arc<dyn CaptureMetrics>) -> Arc<dyn CaptureMetrics> {
    let mut slot = METRICS_SINK.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *slot, metrics)
}

pub fn record_captured() {
    metrics_sink().record_captured();
}

pub fn record_flushed(count: usize) {
    metrics_sink().record_flushed(count);
}

pub fn record_replayed(count: usize, failures: usize) {
    metrics_sink().record_replayed(count, failures);
}

pub fn record_scrub(report: &ScrubReport) {
    metrics_sink().record_scrub(report);
}

pub fn record_panic(label: &'static str) {
    metrics_sink().record_panic(label);
}
