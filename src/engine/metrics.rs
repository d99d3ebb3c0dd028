//! Engine counters and metric emission.
//!
//! Counters are plain atomics read out through [`CountersSnapshot`];
//! every change is also emitted as a structured metric via tracing by
//! default, with a test sink installable for unit tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(target: "metrics", metric = event.name, value);
            }
            MetricValue::Gauge(value) => {
                tracing::info!(target: "metrics", metric = event.name, value);
            }
        }
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

fn emit(name: &'static str, value: MetricValue) {
    sink().record(MetricEvent { name, value });
}

/// Which transfer path a job runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPath {
    Replication,
    Recovery,
}

/// How a job finished, for counter bucketing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Error,
    Cancelled,
}

/// Monotonic per-path counters plus the live job gauge.
#[derive(Debug, Default)]
pub struct Counters {
    replication_total: AtomicU64,
    replication_error: AtomicU64,
    replication_cancel: AtomicU64,
    recovery_total: AtomicU64,
    recovery_error: AtomicU64,
    recovery_cancel: AtomicU64,
    active_jobs: AtomicI64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub replication_total: u64,
    pub replication_error: u64,
    pub replication_cancel: u64,
    pub recovery_total: u64,
    pub recovery_error: u64,
    pub recovery_cancel: u64,
    pub active_jobs: i64,
}

impl Counters {
    /// Counts a submitted op; every submission bumps its path total so
    /// `error + cancel <= total` holds even for requests rejected before
    /// a job exists.
    pub fn started(&self, path: JobPath) {
        match path {
            JobPath::Replication => {
                let v = self.replication_total.fetch_add(1, Ordering::Relaxed) + 1;
                emit("replication_total", MetricValue::Counter(v));
            }
            JobPath::Recovery => {
                let v = self.recovery_total.fetch_add(1, Ordering::Relaxed) + 1;
                emit("recovery_total", MetricValue::Counter(v));
            }
        }
    }

    pub fn finished(&self, path: JobPath, outcome: JobOutcome) {
        let (cell, name) = match (path, outcome) {
            (JobPath::Replication, JobOutcome::Error) => {
                (&self.replication_error, "replication_error")
            }
            (JobPath::Replication, JobOutcome::Cancelled) => {
                (&self.replication_cancel, "replication_cancel")
            }
            (JobPath::Recovery, JobOutcome::Error) => (&self.recovery_error, "recovery_error"),
            (JobPath::Recovery, JobOutcome::Cancelled) => {
                (&self.recovery_cancel, "recovery_cancel")
            }
            (_, JobOutcome::Success) => return,
        };
        let v = cell.fetch_add(1, Ordering::Relaxed) + 1;
        emit(name, MetricValue::Counter(v));
    }

    pub fn job_created(&self) {
        let v = self.active_jobs.fetch_add(1, Ordering::Relaxed) + 1;
        emit("active_jobs", MetricValue::Gauge(v));
    }

    pub fn job_dropped(&self) {
        let v = self.active_jobs.fetch_sub(1, Ordering::Relaxed) - 1;
        debug_assert!(v >= 0, "active job gauge underflow");
        emit("active_jobs", MetricValue::Gauge(v));
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            replication_total: self.replication_total.load(Ordering::Relaxed),
            replication_error: self.replication_error.load(Ordering::Relaxed),
            replication_cancel: self.replication_cancel.load(Ordering::Relaxed),
            recovery_total: self.recovery_total.load(Ordering::Relaxed),
            recovery_error: self.recovery_error.load(Ordering::Relaxed),
            recovery_cancel: self.recovery_cancel.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSink {
        events: Mutex<Vec<MetricEvent>>,
    }

    impl MetricSink for TestSink {
        fn record(&self, event: MetricEvent) {
            self.events.lock().expect("metrics lock").push(event);
        }
    }

    #[test]
    fn buckets_and_gauge() {
        let counters = Counters::default();
        counters.started(JobPath::Replication);
        counters.started(JobPath::Recovery);
        counters.job_created();
        counters.finished(JobPath::Replication, JobOutcome::Cancelled);
        counters.finished(JobPath::Recovery, JobOutcome::Error);
        counters.finished(JobPath::Recovery, JobOutcome::Success);
        counters.job_dropped();

        let snap = counters.snapshot();
        assert_eq!(snap.replication_total, 1);
        assert_eq!(snap.replication_cancel, 1);
        assert_eq!(snap.replication_error, 0);
        assert_eq!(snap.recovery_total, 1);
        assert_eq!(snap.recovery_error, 1);
        assert_eq!(snap.recovery_cancel, 0);
        assert_eq!(snap.active_jobs, 0);
    }

    #[test]
    fn emissions_reach_installed_sink() {
        let sink = Arc::new(TestSink::default());
        set_sink(sink.clone());

        let counters = Counters::default();
        counters.started(JobPath::Replication);
        counters.job_created();

        let events = sink.events.lock().expect("metrics lock");
        assert!(events.iter().any(|e| e.name == "replication_total"));
        assert!(events.iter().any(|e| e.name == "active_jobs"));
    }
}
