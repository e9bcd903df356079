// Metrics capability interface.
//
// The engine never owns a process-wide collector; callers inject a sink at
// construction and the subsystems report through it.

use std::sync::Arc;

/// Sink for engine-internal measurements.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &'static str, delta: u64);
    fn gauge(&self, name: &'static str, value: f64);
    fn histogram(&self, name: &'static str, value: f64);
}

/// Default sink that discards every measurement.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &'static str, _delta: u64) {}
    fn gauge(&self, _name: &'static str, _value: f64) {}
    fn histogram(&self, _name: &'static str, _value: f64) {}
}

/// Shared handle type used throughout the engine.
pub type Metrics = Arc<dyn MetricsSink>;

pub fn noop() -> Metrics {
    Arc::new(NoopMetrics)
}
