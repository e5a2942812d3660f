use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::util::now_rfc3339;

const DB_LATENCY_WINDOW: usize = 1_000;
const BUCKET_SECS: i64 = 3_600;
const WINDOW_SECS: i64 = 24 * 3_600;

/// Aggregated health counters for the engine. Cheap to record into from the
/// fetch path and the store writer; snapshotted on demand by `health()`.
pub struct Metrics {
    started: Instant,
    started_at: String,
    inner: Mutex<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    buckets: BTreeMap<i64, Bucket>,
    total_latency: Duration,
    request_count: u64,
    store_writes: VecDeque<Duration>,
}

#[derive(Default, Clone, Copy)]
struct Bucket {
    success: u64,
    fail: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: String,
    pub started_at: String,
    pub uptime_seconds: u64,
    pub performance: PerformanceSnapshot,
    pub notification_queue_depth: usize,
    pub monitors: u64,
    pub disk_free_mb: Option<u64>,
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub avg_request_latency_ms: f64,
    pub avg_store_write_ms: f64,
    pub success_rate_24h_percent: f64,
    pub total_requests_24h: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            started_at: now_rfc3339(),
            inner: Mutex::new(MetricsInner::default()),
        }
    }
}

impl Metrics {
    pub fn record_request(&self, latency: Duration, success: bool, epoch_secs: i64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.total_latency += latency;
        inner.request_count += 1;

        let hour = epoch_secs / BUCKET_SECS * BUCKET_SECS;
        let cutoff = epoch_secs - WINDOW_SECS;
        inner.buckets.retain(|ts, _| *ts >= cutoff);
        let bucket = inner.buckets.entry(hour).or_default();
        if success {
            bucket.success += 1;
        } else {
            bucket.fail += 1;
        }
    }

    pub fn record_store_write(&self, latency: Duration) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        if inner.store_writes.len() == DB_LATENCY_WINDOW {
            inner.store_writes.pop_front();
        }
        inner.store_writes.push_back(latency);
    }

    pub fn snapshot(
        &self,
        notification_queue_depth: usize,
        monitors: u64,
        disk_free_mb: Option<u64>,
    ) -> HealthSnapshot {
        let inner = self.inner.lock().expect("metrics lock poisoned");

        let mut total = 0u64;
        let mut success = 0u64;
        for bucket in inner.buckets.values() {
            total += bucket.success + bucket.fail;
            success += bucket.success;
        }
        let success_rate = if total == 0 {
            100.0
        } else {
            success as f64 / total as f64 * 100.0
        };

        let avg_request = if inner.request_count == 0 {
            0.0
        } else {
            inner.total_latency.as_secs_f64() * 1_000.0 / inner.request_count as f64
        };
        let avg_write = if inner.store_writes.is_empty() {
            0.0
        } else {
            inner.store_writes.iter().map(Duration::as_secs_f64).sum::<f64>() * 1_000.0
                / inner.store_writes.len() as f64
        };

        let mut alerts = Vec::new();
        if success_rate < 80.0 && total > 10 {
            alerts.push("success rate below 80% over the last 24h".to_string());
        }
        if let Some(free) = disk_free_mb {
            if free < 500 {
                alerts.push(format!("low disk space: {free} MB free"));
            }
        }

        HealthSnapshot {
            timestamp: now_rfc3339(),
            started_at: self.started_at.clone(),
            uptime_seconds: self.started.elapsed().as_secs(),
            performance: PerformanceSnapshot {
                avg_request_latency_ms: avg_request,
                avg_store_write_ms: avg_write,
                success_rate_24h_percent: success_rate,
                total_requests_24h: total,
            },
            notification_queue_depth,
            monitors,
            disk_free_mb,
            alerts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_reflects_buckets() {
        let metrics = Metrics::default();
        let now = 1_700_000_000i64;
        for _ in 0..8 {
            metrics.record_request(Duration::from_millis(100), true, now);
        }
        for _ in 0..4 {
            metrics.record_request(Duration::from_millis(100), false, now);
        }
        let snap = metrics.snapshot(0, 0, None);
        assert_eq!(snap.performance.total_requests_24h, 12);
        assert!((snap.performance.success_rate_24h_percent - 66.666).abs() < 0.1);
        assert!(snap
            .alerts
            .iter()
            .any(|a| a.contains("success rate below 80%")));
    }

    #[test]
    fn stale_buckets_are_pruned() {
        let metrics = Metrics::default();
        let old = 1_700_000_000i64;
        metrics.record_request(Duration::from_millis(10), false, old);
        metrics.record_request(Duration::from_millis(10), true, old + WINDOW_SECS + BUCKET_SECS);
        let snap = metrics.snapshot(0, 0, None);
        assert_eq!(snap.performance.total_requests_24h, 1);
        assert_eq!(snap.performance.success_rate_24h_percent, 100.0);
    }

    #[test]
    fn store_write_window_is_bounded() {
        let metrics = Metrics::default();
        for _ in 0..(DB_LATENCY_WINDOW + 50) {
            metrics.record_store_write(Duration::from_millis(2));
        }
        let inner = metrics.inner.lock().unwrap();
        assert_eq!(inner.store_writes.len(), DB_LATENCY_WINDOW);
    }

    #[test]
    fn low_disk_raises_alert() {
        let metrics = Metrics::default();
        let snap = metrics.snapshot(3, 10, Some(120));
        assert!(snap.alerts.iter().any(|a| a.contains("low disk space")));
        assert_eq!(snap.notification_queue_depth, 3);
    }
}
