//! Prometheus metrics for GHM

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec,
};

use crate::condition::LifecycleState;

/// Diagnostic source queries attempted
static POLLS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!("ghm_polls_total", "Total number of diagnostic source polls"))
        .expect("Failed to create polls metric")
});

/// Failed diagnostic source queries
static POLL_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("ghm_poll_failures_total", "Total number of failed diagnostic source polls"),
        &["reason"]
    )
    .expect("Failed to create poll_failures metric")
});

/// Poll duration histogram
static POLL_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "ghm_poll_duration_seconds",
        "Duration of diagnostic source polls",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to create poll_duration metric")
});

/// Conditions reported by the last successful poll
static ACTIVE_CONDITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "ghm_active_conditions",
        "Number of conditions reported by the last successful poll"
    ))
    .expect("Failed to create active_conditions metric")
});

/// Events delivered to a connector
static EVENTS_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("ghm_events_emitted_total", "Total number of health events delivered"),
        &["processor", "state", "severity"]
    )
    .expect("Failed to create events_emitted metric")
});

/// Events dropped after exhausting delivery retries
static TRANSMISSION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "ghm_transmission_failures_total",
            "Total number of events dropped after delivery retries"
        ),
        &["processor"]
    )
    .expect("Failed to create transmission_failures metric")
});

/// Error codes missing from the mapping table
static UNKNOWN_CODES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "ghm_unknown_codes_total",
        "Total number of conditions with an unmapped error code"
    ))
    .expect("Failed to create unknown_codes metric")
});

/// Processor failures observed by the watcher
static DISPATCH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("ghm_dispatch_failures_total", "Total number of failed condition dispatches"),
        &["processor"]
    )
    .expect("Failed to create dispatch_failures metric")
});

/// ONGOING transitions dropped because a processor queue was full
static DROPPED_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("ghm_dropped_events_total", "Total number of transitions dropped on a full processor queue"),
        &["processor"]
    )
    .expect("Failed to create dropped_events metric")
});

/// Conditions held in each processor's state store
static TRACKED_CONDITIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("ghm_tracked_conditions", "Number of conditions in the state store"),
        &["processor"]
    )
    .expect("Failed to create tracked_conditions metric")
});

/// Metrics registry wrapper
#[derive(Debug, Clone, Copy)]
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*POLLS;
        let _ = &*POLL_FAILURES;
        let _ = &*POLL_DURATION;
        let _ = &*ACTIVE_CONDITIONS;
        let _ = &*EVENTS_EMITTED;
        let _ = &*TRANSMISSION_FAILURES;
        let _ = &*UNKNOWN_CODES;
        let _ = &*DISPATCH_FAILURES;
        let _ = &*DROPPED_EVENTS;
        let _ = &*TRACKED_CONDITIONS;
        Self
    }

    /// Record a finished poll, successful or not
    pub fn observe_poll(&self, duration_secs: f64) {
        POLLS.inc();
        POLL_DURATION.observe(duration_secs);
    }

    pub fn inc_poll_failure(&self, reason: &str) {
        POLL_FAILURES.with_label_values(&[reason]).inc();
    }

    pub fn set_active_conditions(&self, count: usize) {
        ACTIVE_CONDITIONS.set(count as i64);
    }

    pub fn inc_event_emitted(&self, processor: &str, state: LifecycleState, severity: &str) {
        EVENTS_EMITTED
            .with_label_values(&[processor, state.as_str(), severity])
            .inc();
    }

    pub fn inc_transmission_failure(&self, processor: &str) {
        TRANSMISSION_FAILURES.with_label_values(&[processor]).inc();
    }

    pub fn inc_unknown_code(&self) {
        UNKNOWN_CODES.inc();
    }

    pub fn inc_dispatch_failure(&self, processor: &str) {
        DISPATCH_FAILURES.with_label_values(&[processor]).inc();
    }

    pub fn inc_dropped_events(&self, processor: &str, count: usize) {
        DROPPED_EVENTS
            .with_label_values(&[processor])
            .inc_by(count as u64);
    }

    pub fn set_tracked_conditions(&self, processor: &str, count: usize) {
        TRACKED_CONDITIONS
            .with_label_values(&[processor])
            .set(count as i64);
    }

    pub fn polls(&self) -> u64 {
        POLLS.get()
    }

    pub fn poll_failures(&self, reason: &str) -> u64 {
        POLL_FAILURES.with_label_values(&[reason]).get()
    }

    pub fn events_emitted(&self, processor: &str, state: LifecycleState, severity: &str) -> u64 {
        EVENTS_EMITTED
            .with_label_values(&[processor, state.as_str(), severity])
            .get()
    }

    pub fn transmission_failures(&self, processor: &str) -> u64 {
        TRANSMISSION_FAILURES.with_label_values(&[processor]).get()
    }

    pub fn dispatch_failures(&self, processor: &str) -> u64 {
        DISPATCH_FAILURES.with_label_values(&[processor]).get()
    }

    pub fn dropped_events(&self, processor: &str) -> u64 {
        DROPPED_EVENTS.with_label_values(&[processor]).get()
    }

    pub fn tracked_conditions(&self, processor: &str) -> i64 {
        TRACKED_CONDITIONS.with_label_values(&[processor]).get()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();

        let polls = registry.polls();
        registry.observe_poll(0.025);
        assert!(registry.polls() > polls);

        registry.inc_poll_failure("metrics-test-timeout");
        assert_eq!(registry.poll_failures("metrics-test-timeout"), 1);

        registry.inc_event_emitted("metrics-test", LifecycleState::New, "Fatal");
        assert_eq!(
            registry.events_emitted("metrics-test", LifecycleState::New, "Fatal"),
            1
        );

        registry.set_tracked_conditions("metrics-test", 3);
        assert_eq!(registry.tracked_conditions("metrics-test"), 3);

        registry.set_active_conditions(2);
        registry.inc_unknown_code();
        registry.inc_transmission_failure("metrics-test");
        registry.inc_dispatch_failure("metrics-test");

        registry.inc_dropped_events("metrics-test", 4);
        assert_eq!(registry.dropped_events("metrics-test"), 4);
    }

    #[test]
    fn test_metrics_gathered() {
        MetricsRegistry::new();
        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "ghm_polls_total"));
        assert!(names.iter().any(|n| n == "ghm_poll_duration_seconds"));
    }
}
