//! Prometheus metrics registry for guest execution.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Guest call duration buckets (in seconds).
/// Covers 50µs to 1s; guest calls are expected to be short.
const DURATION_BUCKETS: [f64; 11] = [
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.25, 1.0,
];

/// Guest call phase labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

/// Trap labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TrapLabels {
    pub phase: String,
    pub class: String,
}

/// Discarded instance labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DiscardLabels {
    pub reason: String,
}

/// Metrics registry holding all middleware metrics.
///
/// One registry may be shared by several middlewares.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    // Guest call metrics
    pub guest_calls_total: Family<PhaseLabels, Counter>,
    pub guest_call_duration_seconds: Family<PhaseLabels, Histogram>,
    pub guest_traps_total: Family<TrapLabels, Counter>,

    // Instance metrics
    pub instances_created_total: Counter,
    pub instances_discarded_total: Family<DiscardLabels, Counter>,
    pub idle_instances: Gauge,

    // Request metrics
    pub requests_cancelled_total: Counter,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let guest_calls_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "httpwasm_guest_calls",
            "Total number of guest entrypoint calls",
            guest_calls_total.clone(),
        );

        let guest_call_duration_seconds =
            Family::<PhaseLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.iter().cloned())
            });
        registry.register(
            "httpwasm_guest_call_duration_seconds",
            "Guest entrypoint execution duration in seconds",
            guest_call_duration_seconds.clone(),
        );

        let guest_traps_total = Family::<TrapLabels, Counter>::default();
        registry.register(
            "httpwasm_guest_traps",
            "Total number of guest calls that trapped or faulted",
            guest_traps_total.clone(),
        );

        let instances_created_total = Counter::default();
        registry.register(
            "httpwasm_instances_created",
            "Total number of guest instances created",
            instances_created_total.clone(),
        );

        let instances_discarded_total = Family::<DiscardLabels, Counter>::default();
        registry.register(
            "httpwasm_instances_discarded",
            "Total number of pooled guest instances dropped instead of reused",
            instances_discarded_total.clone(),
        );

        let idle_instances = Gauge::default();
        registry.register(
            "httpwasm_idle_instances",
            "Number of guest instances waiting in the pool",
            idle_instances.clone(),
        );

        let requests_cancelled_total = Counter::default();
        registry.register(
            "httpwasm_requests_cancelled",
            "Total number of requests cancelled while a guest was in flight",
            requests_cancelled_total.clone(),
        );

        Self {
            registry,
            guest_calls_total,
            guest_call_duration_seconds,
            guest_traps_total,
            instances_created_total,
            instances_discarded_total,
            idle_instances,
            requests_cancelled_total,
        }
    }

    /// Record one guest entrypoint call.
    ///
    /// `trap` carries the failure class when the call trapped.
    pub fn record_guest_call(&self, phase: &str, duration_secs: f64, trap: Option<&str>) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.guest_calls_total.get_or_create(&labels).inc();
        self.guest_call_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);

        if let Some(class) = trap {
            let labels = TrapLabels {
                phase: phase.to_string(),
                class: class.to_string(),
            };
            self.guest_traps_total.get_or_create(&labels).inc();
        }
    }

    pub fn instance_created(&self) {
        self.instances_created_total.inc();
    }

    /// Record an instance dropped instead of returned to the pool.
    pub fn instance_discarded(&self, reason: &str) {
        let labels = DiscardLabels {
            reason: reason.to_string(),
        };
        self.instances_discarded_total.get_or_create(&labels).inc();
    }

    pub fn set_idle_instances(&self, idle: usize) {
        self.idle_instances.set(idle as i64);
    }

    pub fn request_cancelled(&self) {
        self.requests_cancelled_total.inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
