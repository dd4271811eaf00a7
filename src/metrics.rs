//! `MetricsHandler`. The metric *sinks* themselves (Prometheus, statsd, ...)
//! are out of scope; this module defines the interface plus two
//! implementations kept deliberately small: [`NoopMetrics`] for the server
//! binary and [`AtomicMetrics`] as an in-process test double.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

/// The named metric series the coordinator reports against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Series {
    InFlightReadRequests,
    InFlightWriteRequests,
    ProxyReadLatencyHist,
    ProxyWriteLatencyHist,
    OriginReadLatencyHist,
    OriginWriteLatencyHist,
    TargetWriteLatencyHist,
    SuccessReads,
    FailedReads,
    UnpreparedReads,
    ReadTimeoutsOriginCluster,
    SuccessBothWrites,
    FailedBothWrites,
    FailedOriginOnlyWrites,
    FailedTargetOnlyWrites,
    UnpreparedOriginWrites,
    UnpreparedTargetWrites,
    WriteTimeoutsOriginCluster,
    WriteTimeoutsTargetCluster,
}

impl Series {
    pub fn name(self) -> &'static str {
        match self {
            Series::InFlightReadRequests => "InFlightReadRequests",
            Series::InFlightWriteRequests => "InFlightWriteRequests",
            Series::ProxyReadLatencyHist => "ProxyReadLatencyHist",
            Series::ProxyWriteLatencyHist => "ProxyWriteLatencyHist",
            Series::OriginReadLatencyHist => "OriginReadLatencyHist",
            Series::OriginWriteLatencyHist => "OriginWriteLatencyHist",
            Series::TargetWriteLatencyHist => "TargetWriteLatencyHist",
            Series::SuccessReads => "SuccessReads",
            Series::FailedReads => "FailedReads",
            Series::UnpreparedReads => "UnpreparedReads",
            Series::ReadTimeoutsOriginCluster => "ReadTimeoutsOriginCluster",
            Series::SuccessBothWrites => "SuccessBothWrites",
            Series::FailedBothWrites => "FailedBothWrites",
            Series::FailedOriginOnlyWrites => "FailedOriginOnlyWrites",
            Series::FailedTargetOnlyWrites => "FailedTargetOnlyWrites",
            Series::UnpreparedOriginWrites => "UnpreparedOriginWrites",
            Series::UnpreparedTargetWrites => "UnpreparedTargetWrites",
            Series::WriteTimeoutsOriginCluster => "WriteTimeOutsOriginCluster",
            Series::WriteTimeoutsTargetCluster => "WriteTimeOutsTargetCluster",
        }
    }
}

/// The metrics collaborator interface: `increment_count` for monotonic
/// counters, `decrement_count` for the up/down gauges (in-flight request
/// counts), and `track_in_histogram` for latency sampling. Implementations
/// must be safe to share across every `ClientHandler` in the process —
/// metric sinks outlive any single connection.
pub trait MetricsHandler: Send + Sync + 'static {
    fn increment_count(&self, series: Series);
    fn decrement_count(&self, series: Series);
    fn track_in_histogram(&self, series: Series, start_time: Instant);
}

/// Discards everything. The default for the server binary, since a real
/// sink (Prometheus, statsd, ...) is a collaborator outside this crate's
/// scope.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsHandler for NoopMetrics {
    fn increment_count(&self, _series: Series) {}
    fn decrement_count(&self, _series: Series) {}
    fn track_in_histogram(&self, _series: Series, _start_time: Instant) {}
}

/// An in-process counters/histogram-bucket implementation used by the test
/// suite to assert on named series without standing up a real metrics
/// backend.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counts: DashMap<&'static str, AtomicU64>,
    histogram_samples: DashMap<&'static str, AtomicU64>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, series: Series) -> u64 {
        self.counts
            .get(series.name())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn histogram_sample_count(&self, series: Series) -> u64 {
        self.histogram_samples
            .get(series.name())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counts
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

impl MetricsHandler for AtomicMetrics {
    fn increment_count(&self, series: Series) {
        self.counts
            .entry(series.name())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn decrement_count(&self, series: Series) {
        self.counts
            .entry(series.name())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .ok();
    }

    fn track_in_histogram(&self, series: Series, start_time: Instant) {
        let _elapsed = start_time.elapsed();
        self.histogram_samples
            .entry(series.name())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}
