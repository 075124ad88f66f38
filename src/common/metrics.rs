//! Metrics collection
//!
//! Pipeline components report through the [`MetricsSink`] trait and never
//! touch a global. [`MetricsRegistry`] is the in-process sink: atomic
//! counters, gauges and latency histograms rendered in the Prometheus text
//! format for `/metrics`.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Counted pipeline events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    CacheHit,
    CacheMiss,
    CacheError,
    CacheRepopulateFailed,
    CacheInvalidateFailed,
    CacheRefreshFailed,
    StoreRead,
    StoreError,
    MessagePublished,
    PublishFailed,
    MessageApplied,
    MessageRedelivered,
    PoisonMessage,
}

impl Metric {
    pub const ALL: [Metric; 13] = [
        Metric::CacheHit,
        Metric::CacheMiss,
        Metric::CacheError,
        Metric::CacheRepopulateFailed,
        Metric::CacheInvalidateFailed,
        Metric::CacheRefreshFailed,
        Metric::StoreRead,
        Metric::StoreError,
        Metric::MessagePublished,
        Metric::PublishFailed,
        Metric::MessageApplied,
        Metric::MessageRedelivered,
        Metric::PoisonMessage,
    ];

    /// Prometheus series name
    pub fn name(&self) -> &'static str {
        match self {
            Metric::CacheHit => "kvpipe_cache_hit_total",
            Metric::CacheMiss => "kvpipe_cache_miss_total",
            Metric::CacheError => "kvpipe_cache_error_total",
            Metric::CacheRepopulateFailed => "kvpipe_cache_repopulate_failed_total",
            Metric::CacheInvalidateFailed => "kvpipe_cache_invalidate_failed_total",
            Metric::CacheRefreshFailed => "kvpipe_cache_refresh_failed_total",
            Metric::StoreRead => "kvpipe_store_read_total",
            Metric::StoreError => "kvpipe_store_error_total",
            Metric::MessagePublished => "kvpipe_mq_published_total",
            Metric::PublishFailed => "kvpipe_mq_publish_failed_total",
            Metric::MessageApplied => "kvpipe_mq_applied_total",
            Metric::MessageRedelivered => "kvpipe_mq_redelivered_total",
            Metric::PoisonMessage => "kvpipe_mq_poison_total",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Metric::CacheHit => "Reads served from the cache",
            Metric::CacheMiss => "Reads that fell back to the store",
            Metric::CacheError => "Cache calls that failed or timed out on the read path",
            Metric::CacheRepopulateFailed => "Background cache fills that failed",
            Metric::CacheInvalidateFailed => "Eager cache invalidations that failed",
            Metric::CacheRefreshFailed => "Cache refreshes after apply that failed",
            Metric::StoreRead => "Reads served by the durable store",
            Metric::StoreError => "Durable store calls that failed",
            Metric::MessagePublished => "Messages durably queued",
            Metric::PublishFailed => "Publishes rejected by the queue",
            Metric::MessageApplied => "Messages applied and acknowledged",
            Metric::MessageRedelivered => "Messages handed back for redelivery",
            Metric::PoisonMessage => "Undecodable messages dropped",
        }
    }
}

/// Where pipeline components report what happened
pub trait MetricsSink: Send + Sync {
    /// Count one occurrence of `metric`
    fn incr(&self, metric: Metric);

    /// Record the latency of a named operation
    fn observe(&self, operation: &str, elapsed: Duration);

    /// Set a labelled gauge (queue depth per channel and the like)
    fn set_gauge(&self, name: &str, label: &str, value: u64);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _metric: Metric) {}
    fn observe(&self, _operation: &str, _elapsed: Duration) {}
    fn set_gauge(&self, _name: &str, _label: &str, _value: u64) {}
}

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let mut buckets = Vec::with_capacity(boundaries.len() + 1);
        for _ in 0..=boundaries.len() {
            buckets.push(AtomicU64::new(0));
        }
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // sum kept in thousandths for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative buckets, `+Inf` last
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Endpoint metrics
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// In-process metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    counters: HashMap<Metric, Counter>,
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,
    operations: Mutex<HashMap<String, Arc<Histogram>>>,
    gauges: Mutex<HashMap<(String, String), Arc<Gauge>>>,
    start_time: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // the maps stay consistent even if a holder panicked
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: Metric::ALL.iter().map(|m| (*m, Counter::new())).collect(),
            endpoints: Mutex::new(HashMap::new()),
            operations: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Current value of a pipeline counter
    pub fn get(&self, metric: Metric) -> u64 {
        self.counters.get(&metric).map(Counter::get).unwrap_or(0)
    }

    /// Current value of a labelled gauge
    pub fn gauge(&self, name: &str, label: &str) -> Option<u64> {
        lock(&self.gauges)
            .get(&(name.to_string(), label.to_string()))
            .map(|g| g.get())
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        lock(&self.endpoints)
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    /// Record a served HTTP request
    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            endpoint.requests_error.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.write_prometheus(&mut out);
        out
    }

    fn write_prometheus(&self, out: &mut String) -> std::fmt::Result {
        for metric in Metric::ALL {
            writeln!(out, "# HELP {} {}", metric.name(), metric.help())?;
            writeln!(out, "# TYPE {} counter", metric.name())?;
            writeln!(out, "{} {}", metric.name(), self.get(metric))?;
        }

        writeln!(out, "# HELP kvpipe_uptime_seconds Server uptime in seconds")?;
        writeln!(out, "# TYPE kvpipe_uptime_seconds gauge")?;
        writeln!(out, "kvpipe_uptime_seconds {}", self.uptime_seconds())?;

        let gauges = lock(&self.gauges);
        let mut gauge_keys: Vec<_> = gauges.keys().collect();
        gauge_keys.sort();
        let mut last_name: Option<&str> = None;
        for key in gauge_keys {
            let (name, label) = key;
            if last_name != Some(name.as_str()) {
                writeln!(out, "# TYPE {} gauge", name)?;
                last_name = Some(name.as_str());
            }
            writeln!(out, "{}{{queue=\"{}\"}} {}", name, label, gauges[key].get())?;
        }
        drop(gauges);

        let endpoints = lock(&self.endpoints);
        writeln!(out, "# HELP kvpipe_requests_total Requests per endpoint")?;
        writeln!(out, "# TYPE kvpipe_requests_total counter")?;
        for (path, metrics) in endpoints.iter() {
            writeln!(
                out,
                "kvpipe_requests_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_total.get()
            )?;
        }
        writeln!(out, "# HELP kvpipe_request_errors_total Errors per endpoint")?;
        writeln!(out, "# TYPE kvpipe_request_errors_total counter")?;
        for (path, metrics) in endpoints.iter() {
            writeln!(
                out,
                "kvpipe_request_errors_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_error.get()
            )?;
        }
        writeln!(
            out,
            "# HELP kvpipe_request_duration_ms Request duration in milliseconds"
        )?;
        writeln!(out, "# TYPE kvpipe_request_duration_ms histogram")?;
        for (path, metrics) in endpoints.iter() {
            write_histogram(
                out,
                "kvpipe_request_duration_ms",
                "path",
                path,
                &metrics.latency,
            )?;
        }
        drop(endpoints);

        let operations = lock(&self.operations);
        writeln!(
            out,
            "# HELP kvpipe_operation_duration_ms Dependency call duration in milliseconds"
        )?;
        writeln!(out, "# TYPE kvpipe_operation_duration_ms histogram")?;
        for (operation, histogram) in operations.iter() {
            write_histogram(
                out,
                "kvpipe_operation_duration_ms",
                "operation",
                operation,
                histogram,
            )?;
        }

        Ok(())
    }
}

fn write_histogram(
    out: &mut String,
    name: &str,
    label: &str,
    value: &str,
    histogram: &Histogram,
) -> std::fmt::Result {
    for (le, count) in histogram.get_buckets() {
        if le.is_infinite() {
            writeln!(
                out,
                "{}_bucket{{{}=\"{}\",le=\"+Inf\"}} {}",
                name, label, value, count
            )?;
        } else {
            writeln!(
                out,
                "{}_bucket{{{}=\"{}\",le=\"{}\"}} {}",
                name, label, value, le, count
            )?;
        }
    }
    writeln!(
        out,
        "{}_sum{{{}=\"{}\"}} {}",
        name,
        label,
        value,
        histogram.sum()
    )?;
    writeln!(
        out,
        "{}_count{{{}=\"{}\"}} {}",
        name,
        label,
        value,
        histogram.count()
    )
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MetricsRegistry {
    fn incr(&self, metric: Metric) {
        if let Some(counter) = self.counters.get(&metric) {
            counter.inc();
        }
    }

    fn observe(&self, operation: &str, elapsed: Duration) {
        let histogram = lock(&self.operations)
            .entry(operation.to_string())
            .or_default()
            .clone();
        histogram.observe(elapsed.as_secs_f64() * 1000.0);
    }

    fn set_gauge(&self, name: &str, label: &str, value: u64) {
        let gauge = lock(&self.gauges)
            .entry((name.to_string(), label.to_string()))
            .or_default()
            .clone();
        gauge.set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);

        let buckets = hist.get_buckets();
        assert_eq!(buckets.len(), LATENCY_BUCKETS.len() + 1);
        // 5.0 lands in the `le=5` bucket
        assert_eq!(buckets[1], (5.0, 1));
        assert_eq!(buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_counter() {
        let counter = Counter::new();

        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_registry_counts_pipeline_events() {
        let registry = MetricsRegistry::new();

        registry.incr(Metric::CacheHit);
        registry.incr(Metric::CacheHit);
        registry.incr(Metric::PoisonMessage);

        assert_eq!(registry.get(Metric::CacheHit), 2);
        assert_eq!(registry.get(Metric::PoisonMessage), 1);
        assert_eq!(registry.get(Metric::CacheMiss), 0);
    }

    #[test]
    fn test_registry_records_requests() {
        let registry = MetricsRegistry::new();

        registry.record_request("/kv", Duration::from_millis(50), true);
        registry.record_request("/kv", Duration::from_millis(100), false);

        let endpoint = registry.endpoint("/kv");
        assert_eq!(endpoint.requests_total.get(), 2);
        assert_eq!(endpoint.requests_error.get(), 1);
        assert_eq!(endpoint.latency.count(), 2);
    }

    #[test]
    fn test_prometheus_rendering() {
        let registry = MetricsRegistry::new();
        registry.incr(Metric::MessageApplied);
        registry.set_gauge("kvpipe_mq_queue_size", "writes", 7);
        registry.observe("store_upsert", Duration::from_millis(3));

        assert_eq!(registry.gauge("kvpipe_mq_queue_size", "writes"), Some(7));

        let text = registry.to_prometheus();
        assert!(text.contains("kvpipe_mq_applied_total 1"));
        assert!(text.contains("kvpipe_mq_queue_size{queue=\"writes\"} 7"));
        assert!(text.contains("kvpipe_operation_duration_ms_count{operation=\"store_upsert\"} 1"));
    }
}
