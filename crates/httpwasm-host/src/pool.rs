//! Free list of idle guest instances for the pooled strategy.
//!
//! An instance is either idle in the pool or owned by exactly one request;
//! checkout moves it out, so two in-flight requests never share one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use httpwasm_telemetry::{log_instance_discarded, MetricsRegistry};
use parking_lot::Mutex;

use crate::instance::GuestInstance;

/// Why an instance was dropped instead of returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiscardReason {
    /// The guest trapped or faulted.
    Failed,
    /// The request was cancelled while the instance was pinned.
    Cancelled,
    /// The pool was closed.
    Closed,
}

impl DiscardReason {
    fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Failed => "failed",
            DiscardReason::Cancelled => "cancelled",
            DiscardReason::Closed => "closed",
        }
    }
}

pub(crate) struct InstancePool {
    idle: Mutex<Vec<GuestInstance>>,
    closed: AtomicBool,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl InstancePool {
    pub(crate) fn new(metrics: Option<Arc<MetricsRegistry>>) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Take the most recently returned instance, if any.
    pub(crate) fn checkout(&self) -> Option<GuestInstance> {
        let mut idle = self.idle.lock();
        let instance = idle.pop();
        self.report_idle(idle.len());
        instance
    }

    /// Return an instance whose request completed cleanly.
    pub(crate) fn checkin(&self, instance: GuestInstance) {
        if self.closed.load(Ordering::Acquire) {
            self.discard(instance, DiscardReason::Closed);
            return;
        }
        let mut idle = self.idle.lock();
        idle.push(instance);
        self.report_idle(idle.len());
    }

    /// Drop an instance that must not serve another request.
    pub(crate) fn discard(&self, instance: GuestInstance, reason: DiscardReason) {
        log_instance_discarded!(
            instance = instance.id(),
            reason = reason.as_str(),
            "guest instance discarded"
        );
        if let Some(metrics) = &self.metrics {
            metrics.instance_discarded(reason.as_str());
            if reason == DiscardReason::Cancelled {
                metrics.request_cancelled();
            }
        }
        drop(instance);
    }

    pub(crate) fn len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Drop every idle instance and refuse later check-ins.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<GuestInstance> = std::mem::take(&mut *self.idle.lock());
        self.report_idle(0);
        for instance in drained {
            self.discard(instance, DiscardReason::Closed);
        }
    }

    fn report_idle(&self, idle: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_idle_instances(idle);
        }
    }
}
