//! Telemetry emitted by the QoS layer.
//!
//! The controller reports through an injected [`StatsSink`]. Sinks must be
//! cheap and must never block the dispatch path for long.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::{IoLatency, VolumeId};

const LATENCY_RING_SIZE: usize = 1024;

/// Why a request was turned away at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Pending queue at capacity.
    QueueFull,
    /// Volume suspended.
    Suspended,
    /// Volume not registered.
    UnknownVolume,
}

/// Receiver of per-request and per-queue telemetry.
pub trait StatsSink: Send + Sync {
    /// Called once per completed request.
    fn record_latency(&self, volume_id: VolumeId, latency: &IoLatency);

    /// Called whenever a queue's pending/outstanding counts change on the dispatch path.
    fn record_queue_depth(&self, volume_id: VolumeId, pending: usize, outstanding: usize);

    /// Called when an enqueue is rejected.
    fn record_rejection(&self, volume_id: VolumeId, reason: RejectReason);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatsSink;

impl StatsSink for NoopStatsSink {
    fn record_latency(&self, _volume_id: VolumeId, _latency: &IoLatency) {}

    fn record_queue_depth(&self, _volume_id: VolumeId, _pending: usize, _outstanding: usize) {}

    fn record_rejection(&self, _volume_id: VolumeId, _reason: RejectReason) {}
}

/// Type of metric for Prometheus compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    /// Monotonically increasing value
    Counter,
    /// Value that can go up or down
    Gauge,
}

/// Value of a metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricValue {
    /// Counter value
    Counter(u64),
    /// Gauge value
    Gauge(f64),
}

/// A single metric with metadata and value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name
    pub name: String,
    /// Help text
    pub help: String,
    /// Type of metric
    pub metric_type: MetricType,
    /// Current value
    pub value: MetricValue,
    /// Label key-value pairs
    pub labels: Vec<(String, String)>,
}

/// Per-volume counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStats {
    /// Requests completed.
    pub completed: u64,
    /// Requests rejected at enqueue.
    pub rejected: u64,
    /// Sum of wait latencies in nanoseconds.
    pub total_wait_ns: u64,
    /// Sum of service latencies in nanoseconds.
    pub total_service_ns: u64,
    /// Sum of end-to-end latencies in nanoseconds.
    pub total_latency_ns: u64,
    /// Largest end-to-end latency seen.
    pub max_latency_ns: u64,
    /// Last reported pending count.
    pub pending: usize,
    /// Last reported outstanding count.
    pub outstanding: usize,
}

impl VolumeStats {
    /// Average wait latency in nanoseconds.
    pub fn avg_wait_ns(&self) -> u64 {
        if self.completed == 0 {
            0
        } else {
            self.total_wait_ns / self.completed
        }
    }

    /// Average end-to-end latency in nanoseconds.
    pub fn avg_latency_ns(&self) -> u64 {
        if self.completed == 0 {
            0
        } else {
            self.total_latency_ns / self.completed
        }
    }
}

#[derive(Default)]
struct MetricsInner {
    volumes: HashMap<VolumeId, VolumeStats>,
    latency_ring: Vec<u64>,
    latency_index: usize,
}

/// In-memory collector implementing [`StatsSink`].
#[derive(Default)]
pub struct QosMetrics {
    inner: Mutex<MetricsInner>,
}

impl QosMetrics {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the per-volume counters.
    pub fn snapshot(&self) -> HashMap<VolumeId, VolumeStats> {
        self.inner.lock().volumes.clone()
    }

    /// Returns the counters of one volume.
    pub fn volume(&self, volume_id: VolumeId) -> Option<VolumeStats> {
        self.inner.lock().volumes.get(&volume_id).cloned()
    }

    /// P99 end-to-end latency over the most recent completions, by nearest
    /// rank: the smallest sample with at least 99% of samples at or below it.
    pub fn p99_latency_ns(&self) -> u64 {
        let inner = self.inner.lock();
        if inner.latency_ring.is_empty() {
            return 0;
        }
        let mut sorted = inner.latency_ring.clone();
        drop(inner);
        sorted.sort_unstable();
        let rank = (sorted.len() as f64 * 0.99).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Resets all counters.
    pub fn reset(&self) {
        *self.inner.lock() = MetricsInner::default();
        debug!("QoS metrics reset");
    }

    /// Export all metrics in Prometheus form.
    pub fn export(&self) -> Vec<Metric> {
        let snapshot = self.snapshot();
        let mut metrics = Vec::new();

        let mut volumes: Vec<_> = snapshot.into_iter().collect();
        volumes.sort_by_key(|(id, _)| *id);

        for (volume_id, stats) in volumes {
            let labels = vec![("volume".to_string(), volume_id.0.to_string())];
            metrics.push(Metric {
                name: "claudefs_qos_completed_total".to_string(),
                help: "Total number of completed requests".to_string(),
                metric_type: MetricType::Counter,
                value: MetricValue::Counter(stats.completed),
                labels: labels.clone(),
            });
            if stats.rejected > 0 {
                metrics.push(Metric {
                    name: "claudefs_qos_rejected_total".to_string(),
                    help: "Total number of requests rejected at enqueue".to_string(),
                    metric_type: MetricType::Counter,
                    value: MetricValue::Counter(stats.rejected),
                    labels: labels.clone(),
                });
            }
            metrics.push(Metric {
                name: "claudefs_qos_pending".to_string(),
                help: "Requests waiting for dispatch".to_string(),
                metric_type: MetricType::Gauge,
                value: MetricValue::Gauge(stats.pending as f64),
                labels: labels.clone(),
            });
            metrics.push(Metric {
                name: "claudefs_qos_outstanding".to_string(),
                help: "Requests dispatched but not completed".to_string(),
                metric_type: MetricType::Gauge,
                value: MetricValue::Gauge(stats.outstanding as f64),
                labels: labels.clone(),
            });
            if stats.completed > 0 {
                metrics.push(Metric {
                    name: "claudefs_qos_wait_latency_avg_us".to_string(),
                    help: "Average queueing latency in microseconds".to_string(),
                    metric_type: MetricType::Gauge,
                    value: MetricValue::Gauge(stats.avg_wait_ns() as f64 / 1_000.0),
                    labels,
                });
            }
        }

        metrics
    }
}

impl StatsSink for QosMetrics {
    fn record_latency(&self, volume_id: VolumeId, latency: &IoLatency) {
        let mut inner = self.inner.lock();
        let stats = inner.volumes.entry(volume_id).or_default();
        stats.completed += 1;
        stats.total_wait_ns = stats.total_wait_ns.saturating_add(latency.wait_ns);
        stats.total_service_ns = stats.total_service_ns.saturating_add(latency.service_ns);
        stats.total_latency_ns = stats.total_latency_ns.saturating_add(latency.total_ns);
        stats.max_latency_ns = stats.max_latency_ns.max(latency.total_ns);

        if inner.latency_ring.len() < LATENCY_RING_SIZE {
            inner.latency_ring.push(latency.total_ns);
        } else {
            let idx = inner.latency_index;
            inner.latency_ring[idx] = latency.total_ns;
            inner.latency_index = (idx + 1) % LATENCY_RING_SIZE;
        }
    }

    fn record_queue_depth(&self, volume_id: VolumeId, pending: usize, outstanding: usize) {
        let mut inner = self.inner.lock();
        let stats = inner.volumes.entry(volume_id).or_default();
        stats.pending = pending;
        stats.outstanding = outstanding;
    }

    fn record_rejection(&self, volume_id: VolumeId, _reason: RejectReason) {
        self.inner.lock().volumes.entry(volume_id).or_default().rejected += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency(total_ns: u64) -> IoLatency {
        IoLatency {
            wait_ns: total_ns / 2,
            service_ns: total_ns - total_ns / 2,
            total_ns,
        }
    }

    #[test]
    fn test_record_latency() {
        let metrics = QosMetrics::new();
        metrics.record_latency(VolumeId(1), &latency(1_000));
        metrics.record_latency(VolumeId(1), &latency(3_000));

        let stats = metrics.volume(VolumeId(1)).unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.avg_latency_ns(), 2_000);
        assert_eq!(stats.avg_wait_ns(), 1_000);
        assert_eq!(stats.max_latency_ns, 3_000);
    }

    #[test]
    fn test_queue_depth_and_rejection() {
        let metrics = QosMetrics::new();
        metrics.record_queue_depth(VolumeId(2), 5, 3);
        metrics.record_rejection(VolumeId(2), RejectReason::QueueFull);

        let stats = metrics.volume(VolumeId(2)).unwrap();
        assert_eq!(stats.pending, 5);
        assert_eq!(stats.outstanding, 3);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn test_p99_latency() {
        let metrics = QosMetrics::new();
        assert_eq!(metrics.p99_latency_ns(), 0);
        for i in 1..=100 {
            metrics.record_latency(VolumeId(1), &latency(i * 1_000));
        }
        assert_eq!(metrics.p99_latency_ns(), 99_000);
    }

    #[test]
    fn test_p99_latency_nearest_rank() {
        let metrics = QosMetrics::new();
        metrics.record_latency(VolumeId(1), &latency(7));
        assert_eq!(metrics.p99_latency_ns(), 7);

        let metrics = QosMetrics::new();
        for i in 1..=200 {
            metrics.record_latency(VolumeId(1), &latency(i));
        }
        assert_eq!(metrics.p99_latency_ns(), 198);

        let metrics = QosMetrics::new();
        for i in 1..=10 {
            metrics.record_latency(VolumeId(1), &latency(i));
        }
        assert_eq!(metrics.p99_latency_ns(), 10);
    }

    #[test]
    fn test_latency_ring_wraps() {
        let metrics = QosMetrics::new();
        for _ in 0..(LATENCY_RING_SIZE + 10) {
            metrics.record_latency(VolumeId(1), &latency(10));
        }
        assert_eq!(metrics.volume(VolumeId(1)).unwrap().completed, LATENCY_RING_SIZE as u64 + 10);
        assert_eq!(metrics.p99_latency_ns(), 10);
    }

    #[test]
    fn test_export() {
        let metrics = QosMetrics::new();
        metrics.record_latency(VolumeId(7), &latency(2_000));
        metrics.record_rejection(VolumeId(7), RejectReason::Suspended);

        let exported = metrics.export();
        assert!(exported
            .iter()
            .any(|m| m.name == "claudefs_qos_completed_total"
                && m.labels == vec![("volume".to_string(), "7".to_string())]));
        assert!(exported.iter().any(|m| m.name == "claudefs_qos_rejected_total"));
        assert!(exported
            .iter()
            .any(|m| m.name == "claudefs_qos_wait_latency_avg_us"));
    }

    #[test]
    fn test_reset() {
        let metrics = QosMetrics::new();
        metrics.record_latency(VolumeId(1), &latency(10));
        metrics.reset();
        assert!(metrics.snapshot().is_empty());
    }

    #[test]
    fn test_noop_sink() {
        let sink = NoopStatsSink;
        sink.record_latency(VolumeId(1), &latency(10));
        sink.record_queue_depth(VolumeId(1), 1, 1);
        sink.record_rejection(VolumeId(1), RejectReason::UnknownVolume);
    }
}
