use log::*;
use prometheus::{
  Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;

/// Job outcome labels for `gojinn_worker_jobs_total`.
pub const JOB_SUCCESS: &str = "success";
pub const JOB_RETRIED: &str = "retried";
pub const JOB_DEAD_LETTERED: &str = "dead-lettered";

pub struct Metrics {
  /// Time taken to execute the WASM function, by path and response status.
  pub duration: HistogramVec,
  /// Number of WASM sandboxes currently running.
  pub active: IntGaugeVec,
  /// Number of pending jobs in the durable work-queue stream.
  pub queue_depth: IntGaugeVec,
  /// Total worker jobs processed, by outcome.
  pub jobs_total: IntCounterVec,
}

impl Metrics {
  fn new() -> Result<Self, prometheus::Error> {
    let duration = HistogramVec::new(
      HistogramOpts::new(
        "gojinn_function_duration_seconds",
        "Time taken to execute the WASM function",
      ),
      &["path", "status"],
    )?;
    let active = IntGaugeVec::new(
      Opts::new("gojinn_active_sandboxes", "Number of WASM sandboxes currently running"),
      &["path"],
    )?;
    let queue_depth = IntGaugeVec::new(
      Opts::new(
        "gojinn_worker_queue_depth",
        "Number of pending jobs in the durable work-queue stream",
      ),
      &["stream"],
    )?;
    let jobs_total = IntCounterVec::new(
      Opts::new("gojinn_worker_jobs_total", "Total number of worker jobs processed by status"),
      &["status"],
    )?;

    return Ok(Self {
      duration,
      active,
      queue_depth,
      jobs_total,
    });
  }

  /// Register all series on `registry`. Collectors that are already present
  /// keep collecting through the existing instance, so re-registration across
  /// engine reloads is a no-op.
  fn register(&self, registry: &Registry) {
    let collectors: [Box<dyn prometheus::core::Collector>; 4] = [
      Box::new(self.duration.clone()),
      Box::new(self.active.clone()),
      Box::new(self.queue_depth.clone()),
      Box::new(self.jobs_total.clone()),
    ];
    for collector in collectors {
      match registry.register(collector) {
        Ok(()) => {}
        Err(prometheus::Error::AlreadyReg) => {}
        Err(err) => warn!("Failed to register metric: {err}"),
      }
    }
  }
}

/// Process-wide metric series. Shared by every engine instance in the
/// process, which is what makes reload and multi-handler setups idempotent:
/// the collectors are created and registered exactly once.
pub fn metrics() -> &'static Metrics {
  static METRICS: LazyLock<Metrics> = LazyLock::new(|| {
    let metrics = Metrics::new().expect("metric descriptors are statically valid");
    metrics.register(prometheus::default_registry());
    return metrics;
  });
  return &METRICS;
}

/// Render the default registry in the Prometheus text exposition format.
pub fn gather_text() -> String {
  let families = prometheus::default_registry().gather();
  let mut buf = Vec::new();
  if let Err(err) = TextEncoder::new().encode(&families, &mut buf) {
    warn!("Failed to encode metrics: {err}");
  }
  return String::from_utf8_lossy(&buf).into_owned();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_metrics_registration_is_idempotent() {
    let first = metrics();
    // Re-running registration against the default registry must not error or
    // produce a second collector.
    first.register(prometheus::default_registry());

    first.jobs_total.with_label_values(&[JOB_SUCCESS]).inc();
    let value = first.jobs_total.with_label_values(&[JOB_SUCCESS]).get();
    assert!(value >= 1);

    let text = gather_text();
    assert!(text.contains("gojinn_worker_jobs_total"));
  }

  #[test]
  fn test_active_gauge_balances() {
    let m = metrics();
    let gauge = m.active.with_label_values(&["test.wasm"]);
    let before = gauge.get();
    gauge.inc();
    gauge.dec();
    assert_eq!(gauge.get(), before);
  }
}
