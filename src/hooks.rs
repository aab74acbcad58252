//! Per-step execution metrics and callback registry.
//!
//! The pipeline builds one [`ExecutionMetric`] per transformer per run and
//! hands it to every registered [`MetricsCallback`], synchronously and in
//! registration order. Callbacks run on the pipeline's execution path, so
//! they should be fast. A callback that errors or panics is logged and
//! skipped; the pipeline never sees the failure.

use crate::error::HookError;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What happened to a transformer during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// `transform` ran and its output was adopted.
    Applied,
    /// `should_apply` returned false.
    Skipped,
    /// `transform` failed; its effect was discarded (or the run aborted).
    Failed,
}

/// One record per transformer invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetric {
    /// Name of the transformer.
    pub transformer_name: String,
    /// Position of the transformer in the pipeline (0-based).
    pub step_index: usize,
    pub status: StepStatus,
    /// Wall-clock duration of `transform` (zero when skipped).
    pub duration: Duration,
    pub messages_before: usize,
    pub messages_after: usize,
    /// Messages present before the step and absent after it.
    pub messages_removed: usize,
    /// Failure message when `status` is `Failed`.
    pub error: Option<String>,
    /// Extra values reported by the transformer.
    pub extra: HashMap<String, Value>,
}

impl ExecutionMetric {
    /// Percentage of messages removed (0.0-100.0).
    pub fn removal_rate(&self) -> f64 {
        if self.messages_before == 0 {
            return 0.0;
        }
        self.messages_removed as f64 / self.messages_before as f64 * 100.0
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }

    pub fn is_skipped(&self) -> bool {
        self.status == StepStatus::Skipped
    }
}

/// Receiver of execution metrics.
///
/// # Example
///
/// ```
/// use textile::hooks::{ExecutionMetric, MetricsCallback};
/// use textile::HookError;
///
/// struct PrintMetrics;
///
/// impl MetricsCallback for PrintMetrics {
///     fn on_metric(&self, m: &ExecutionMetric) -> Result<(), HookError> {
///         println!("{}: {:.2}ms", m.transformer_name, m.duration_ms());
///         Ok(())
///     }
/// }
/// ```
pub trait MetricsCallback: Send + Sync {
    fn on_metric(&self, metric: &ExecutionMetric) -> Result<(), HookError>;
}

/// A [`MetricsCallback`] backed by an infallible closure.
pub struct FnMetricsCallback<F: Fn(&ExecutionMetric) + Send + Sync>(pub F);

impl<F: Fn(&ExecutionMetric) + Send + Sync> MetricsCallback for FnMetricsCallback<F> {
    fn on_metric(&self, metric: &ExecutionMetric) -> Result<(), HookError> {
        (self.0)(metric);
        Ok(())
    }
}

/// Ordered registry of metrics callbacks.
#[derive(Clone, Default)]
pub struct MetricsHook {
    callbacks: Vec<Arc<dyn MetricsCallback>>,
}

impl MetricsHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback. Registration happens at configuration time.
    pub fn register_callback(&mut self, callback: Arc<dyn MetricsCallback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Deliver a metric to every callback in order.
    ///
    /// Returns the number of callbacks that failed.
    pub(crate) fn dispatch(&self, metric: &ExecutionMetric) -> usize {
        let mut failures = 0;
        for (idx, callback) in self.callbacks.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback.on_metric(metric)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(_) => "callback panicked".to_string(),
            };
            failures += 1;
            tracing::warn!(
                callback = idx,
                transformer = %metric.transformer_name,
                error = %reason,
                "metrics callback failed"
            );
        }
        failures
    }
}

impl std::fmt::Debug for MetricsHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsHook")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Aggregate view over collected metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_executions: usize,
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_messages_removed: usize,
    pub avg_duration_ms: f64,
    pub transformers: Vec<String>,
}

/// Callback that keeps every metric it receives, for inspection and stats.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: Mutex<Vec<ExecutionMetric>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ExecutionMetric>> {
        // A poisoned lock only means a reader panicked; the data is still valid.
        self.metrics.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot of every collected metric.
    pub fn metrics(&self) -> Vec<ExecutionMetric> {
        self.lock().clone()
    }

    pub fn by_transformer(&self, name: &str) -> Vec<ExecutionMetric> {
        self.lock()
            .iter()
            .filter(|m| m.transformer_name == name)
            .cloned()
            .collect()
    }

    /// Mean duration in milliseconds. Without a name, skipped steps are excluded.
    pub fn avg_duration_ms(&self, name: Option<&str>) -> f64 {
        let metrics = self.lock();
        let durations: Vec<f64> = metrics
            .iter()
            .filter(|m| match name {
                Some(n) => m.transformer_name == n,
                None => !m.is_skipped(),
            })
            .map(ExecutionMetric::duration_ms)
            .collect();
        if durations.is_empty() {
            return 0.0;
        }
        durations.iter().sum::<f64>() / durations.len() as f64
    }

    pub fn total_messages_removed(&self, name: Option<&str>) -> usize {
        self.lock()
            .iter()
            .filter(|m| name.map_or(true, |n| m.transformer_name == n))
            .map(|m| m.messages_removed)
            .sum()
    }

    pub fn summary(&self) -> MetricsSummary {
        let avg_duration_ms = self.avg_duration_ms(None);
        let total_messages_removed = self.total_messages_removed(None);
        let metrics = self.lock();
        let skipped = metrics.iter().filter(|m| m.is_skipped()).count();
        let failed = metrics
            .iter()
            .filter(|m| m.status == StepStatus::Failed)
            .count();
        let mut seen = HashSet::new();
        let transformers = metrics
            .iter()
            .filter(|m| seen.insert(m.transformer_name.clone()))
            .map(|m| m.transformer_name.clone())
            .collect();
        MetricsSummary {
            total_executions: metrics.len(),
            executed: metrics.len() - skipped,
            skipped,
            failed,
            total_messages_removed,
            avg_duration_ms,
            transformers,
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl MetricsCallback for MetricsCollector {
    fn on_metric(&self, metric: &ExecutionMetric) -> Result<(), HookError> {
        self.lock().push(metric.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metric(
        name: &str,
        status: StepStatus,
        before: usize,
        removed: usize,
        ms: u64,
    ) -> ExecutionMetric {
        ExecutionMetric {
            transformer_name: name.to_string(),
            step_index: 0,
            status,
            duration: Duration::from_millis(ms),
            messages_before: before,
            messages_after: before - removed,
            messages_removed: removed,
            error: None,
            extra: HashMap::new(),
        }
    }

    struct Failing;

    impl MetricsCallback for Failing {
        fn on_metric(&self, _metric: &ExecutionMetric) -> Result<(), HookError> {
            Err(HookError("sink unavailable".into()))
        }
    }

    struct Panicking;

    impl MetricsCallback for Panicking {
        fn on_metric(&self, _metric: &ExecutionMetric) -> Result<(), HookError> {
            panic!("bad callback");
        }
    }

    #[test]
    fn test_removal_rate() {
        assert_eq!(metric("d", StepStatus::Applied, 4, 1, 0).removal_rate(), 25.0);
        assert_eq!(metric("d", StepStatus::Applied, 0, 0, 0).removal_rate(), 0.0);
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut hook = MetricsHook::new();
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            hook.register_callback(Arc::new(FnMetricsCallback(move |_: &ExecutionMetric| {
                order.lock().unwrap().push(tag);
            })));
        }
        assert_eq!(hook.dispatch(&metric("d", StepStatus::Applied, 1, 0, 1)), 0);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_failing_and_panicking_callbacks_do_not_stop_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut hook = MetricsHook::new();
        hook.register_callback(Arc::new(Failing));
        hook.register_callback(Arc::new(Panicking));
        hook.register_callback(Arc::new(FnMetricsCallback(move |_: &ExecutionMetric| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let failures = hook.dispatch(&metric("d", StepStatus::Applied, 1, 0, 1));
        assert_eq!(failures, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collector_summary() {
        let collector = MetricsCollector::new();
        collector.on_metric(&metric("decay", StepStatus::Applied, 10, 3, 4)).unwrap();
        collector.on_metric(&metric("prune", StepStatus::Skipped, 7, 0, 0)).unwrap();
        collector.on_metric(&metric("decay", StepStatus::Applied, 7, 1, 2)).unwrap();

        let summary = collector.summary();
        assert_eq!(summary.total_executions, 3);
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total_messages_removed, 4);
        assert_eq!(summary.avg_duration_ms, 3.0);
        assert_eq!(summary.transformers, vec!["decay", "prune"]);

        assert_eq!(collector.by_transformer("decay").len(), 2);
        assert_eq!(collector.total_messages_removed(Some("decay")), 4);
        assert_eq!(collector.avg_duration_ms(Some("prune")), 0.0);

        collector.clear();
        assert!(collector.metrics().is_empty());
    }
}
