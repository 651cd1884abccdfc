//! Observability metrics for the scheduling pipeline.
//!
//! Exposed via the `metrics` facade; install any compatible exporter at boot
//! to ship them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sluice_flow_task_transitions_total` | Counter | `to_status` | Task status transitions persisted |
//! | `sluice_flow_tasks_begun_total` | Counter | - | Tasks entering the run loop |
//! | `sluice_flow_tasks_completed_total` | Counter | `status` | Tasks leaving the run loop |
//! | `sluice_flow_dispatch_tick_seconds` | Histogram | `result` | Dispatcher tick duration |
//! | `sluice_flow_parse_tick_seconds` | Histogram | `result` | Parser scheduled-watcher tick duration |
//! | `sluice_flow_watchdog_rescues_total` | Counter | `kind` | Instances/tasks rescued by the watchdog |

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: task status transitions persisted.
    pub const TASK_TRANSITIONS_TOTAL: &str = "sluice_flow_task_transitions_total";
    /// Counter: tasks entering the run loop.
    pub const TASKS_BEGUN_TOTAL: &str = "sluice_flow_tasks_begun_total";
    /// Counter: tasks leaving the run loop, by final status.
    pub const TASKS_COMPLETED_TOTAL: &str = "sluice_flow_tasks_completed_total";
    /// Histogram: dispatcher tick duration in seconds.
    pub const DISPATCH_TICK_SECONDS: &str = "sluice_flow_dispatch_tick_seconds";
    /// Histogram: parser scheduled-watcher tick duration in seconds.
    pub const PARSE_TICK_SECONDS: &str = "sluice_flow_parse_tick_seconds";
    /// Counter: watchdog rescues, by kind.
    pub const WATCHDOG_RESCUES_TOTAL: &str = "sluice_flow_watchdog_rescues_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Target task status of a transition.
    pub const TO_STATUS: &str = "to_status";
    /// Final status of a completed task.
    pub const STATUS: &str = "status";
    /// Tick outcome (ok, error).
    pub const RESULT: &str = "result";
    /// Watchdog rescue kind (expired_task, left_behind).
    pub const KIND: &str = "kind";
}

/// High-level recorder for pipeline metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a persisted task status transition.
    pub fn record_task_transition(&self, to_status: &'static str) {
        counter!(names::TASK_TRANSITIONS_TOTAL, labels::TO_STATUS => to_status).increment(1);
    }

    /// Records a task entering the run loop.
    pub fn record_task_begun(&self) {
        counter!(names::TASKS_BEGUN_TOTAL).increment(1);
    }

    /// Records a task leaving the run loop.
    pub fn record_task_completed(&self, status: &'static str) {
        counter!(names::TASKS_COMPLETED_TOTAL, labels::STATUS => status).increment(1);
    }

    /// Records one dispatcher tick.
    pub fn observe_dispatch_tick(&self, seconds: f64, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        histogram!(names::DISPATCH_TICK_SECONDS, labels::RESULT => result).record(seconds);
    }

    /// Records one parser scheduled-watcher tick.
    pub fn observe_parse_tick(&self, seconds: f64, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        histogram!(names::PARSE_TICK_SECONDS, labels::RESULT => result).record(seconds);
    }

    /// Records a watchdog rescue.
    pub fn record_watchdog_rescue(&self, kind: &'static str, count: u64) {
        counter!(names::WATCHDOG_RESCUES_TOTAL, labels::KIND => kind).increment(count);
    }
}

/// Runs a closure with the elapsed duration when dropped.
pub struct TimingGuard<F: FnMut(std::time::Duration)> {
    start: Instant,
    observe: F,
}

impl<F: FnMut(std::time::Duration)> TimingGuard<F> {
    /// Starts timing.
    pub fn new(observe: F) -> Self {
        Self {
            start: Instant::now(),
            observe,
        }
    }
}

impl<F: FnMut(std::time::Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        (self.observe)(self.start.elapsed());
    }
}
