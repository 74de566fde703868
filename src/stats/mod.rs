use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::utils::as_millis_f64;

pub mod csv;
pub mod thresholds;

/// Built-in metric names. They follow the k6 naming so existing threshold
/// blocks can be reused verbatim.
pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATION_ERRORS: &str = "iteration_errors";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

// Values are stored scaled by 1000 (milliseconds -> microseconds for latencies,
// thousandths for custom trends). Two significant digits keep every recorded
// value within 1% of the truth.
const TREND_SCALE: f64 = 1000.0;
const TREND_HIGHEST: u64 = 60 * 60 * 1000 * 1000;
const TREND_SIGFIG: u8 = 2;

/// Outcome of one HTTP request. Produced by the executor, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSample {
    /// Grouping key for per-endpoint stats (the request name or URL path).
    pub endpoint_tag: String,
    pub method: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// `None` when no response arrived (DNS, connect, timeout...).
    pub status: Option<u16>,
    pub error: Option<String>,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

impl RequestSample {
    /// A request counts towards `http_req_failed` when it errored or the
    /// server answered with a 4xx/5xx.
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.status.is_none_or(|s| s >= 400)
    }
}

#[derive(Debug, Clone)]
pub enum Metric {
    Request(RequestSample),
    Check {
        name: String,
        success: bool,
    },
    Iteration {
        duration: Duration,
        error: Option<String>,
    },
    // Custom Metrics
    Trend {
        name: String,
        value: f64,
    },
    Rate {
        name: String,
        success: bool,
    },
    Counter {
        name: String,
        value: f64,
    },
    Gauge {
        name: String,
        value: f64,
    },
}

/// Streaming distribution: HDR histogram for quantiles plus exact
/// count/sum/min/max.
#[derive(Debug, Clone)]
pub struct TrendStats {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for TrendStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TrendStats {
    pub fn new() -> Self {
        Self {
            // Bounds are constants, construction cannot fail.
            histogram: Histogram::<u64>::new_with_bounds(1, TREND_HIGHEST, TREND_SIGFIG)
                .unwrap_or_else(|_| unreachable!("static histogram bounds are valid")),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn record(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let scaled = (value * TREND_SCALE).round().max(1.0) as u64;
        self.histogram.saturating_record(scaled);
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &TrendStats) {
        if other.count == 0 {
            return;
        }
        // Same bounds on both sides, so add() cannot fail.
        let _ = self.histogram.add(&other.histogram);
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    /// `q` in 0..=1. Empty trends report 0.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let v = self.histogram.value_at_quantile(q.clamp(0.0, 1.0)) as f64 / TREND_SCALE;
        // The histogram rounds to bucket edges; never report outside the observed range.
        v.clamp(self.min, self.max)
    }

    pub fn to_report(&self) -> TrendReport {
        TrendReport {
            count: self.count,
            avg: self.avg(),
            min: self.min(),
            med: self.quantile(0.5),
            max: self.max(),
            p90: self.quantile(0.9),
            p95: self.quantile(0.95),
            p99: self.quantile(0.99),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestStats {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub duration: TrendStats,
    pub total_response_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrendReport {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestReport {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub duration_ms: TrendReport,
    pub avg_response_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateReport {
    pub total: usize,
    pub success: usize,
    pub rate: f64,
}

impl RateReport {
    fn new(total: usize, success: usize) -> Self {
        let rate = if total > 0 {
            success as f64 / total as f64
        } else {
            0.0
        };
        Self {
            total,
            success,
            rate,
        }
    }
}

/// Serializable view of an aggregator, used for printing and exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReportStats {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub http_req_failed_rate: f64,
    pub http_req_duration: TrendReport,
    pub status_codes: BTreeMap<u16, usize>,
    pub errors: BTreeMap<String, usize>,
    /// name -> (total, passes)
    pub checks: BTreeMap<String, (usize, usize)>,
    pub checks_rate: f64,
    pub grouped_requests: BTreeMap<String, RequestReport>,
    pub iterations: u64,
    pub iteration_errors: u64,
    pub iteration_duration: TrendReport,
    pub total_data_sent: u64,
    pub total_data_received: u64,
    // Custom Metrics
    pub trends: BTreeMap<String, TrendReport>,
    pub rates: BTreeMap<String, RateReport>,
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
}

/// A metric resolved by name, built-in or custom.
#[derive(Debug, Clone, Copy)]
pub enum MetricView<'a> {
    Counter(f64),
    Rate { total: usize, success: usize },
    Trend(&'a TrendStats),
    Gauge(f64),
}

impl MetricView<'_> {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricView::Counter(_) => MetricKind::Counter,
            MetricView::Rate { .. } => MetricKind::Rate,
            MetricView::Trend(_) => MetricKind::Trend,
            MetricView::Gauge(_) => MetricKind::Gauge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
    Gauge,
}

/// Kind of a built-in metric, `None` for custom names.
pub fn builtin_kind(name: &str) -> Option<MetricKind> {
    match name {
        HTTP_REQS | ITERATIONS | ITERATION_ERRORS => Some(MetricKind::Counter),
        HTTP_REQ_FAILED | CHECKS => Some(MetricKind::Rate),
        HTTP_REQ_DURATION | ITERATION_DURATION => Some(MetricKind::Trend),
        VUS | VUS_MAX => Some(MetricKind::Gauge),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub http_duration: TrendStats,
    pub status_codes: HashMap<u16, usize>,
    pub errors: HashMap<String, usize>,
    pub checks: HashMap<String, (usize, usize)>,
    pub requests: HashMap<String, RequestStats>,
    pub total_data_sent: u64,
    pub total_data_received: u64,
    pub iterations: u64,
    pub iteration_errors: u64,
    pub iteration_duration: TrendStats,
    // Custom Metrics Storage
    pub trends: HashMap<String, TrendStats>,
    pub rates: HashMap<String, (usize, usize)>, // (total, success)
    pub counters: HashMap<String, f64>,
    pub gauges: HashMap<String, f64>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, metric: Metric) {
        match metric {
            Metric::Request(sample) => {
                let failed = sample.failed();
                let millis = as_millis_f64(sample.duration);

                self.total_requests += 1;
                self.http_duration.record(millis);
                if failed {
                    self.failed_requests += 1;
                }
                if let Some(status) = sample.status {
                    *self.status_codes.entry(status).or_insert(0) += 1;
                }
                if let Some(err) = sample.error {
                    *self.errors.entry(err).or_insert(0) += 1;
                }

                let req_stats = self.requests.entry(sample.endpoint_tag).or_default();
                req_stats.total_requests += 1;
                req_stats.duration.record(millis);
                if failed {
                    req_stats.failed_requests += 1;
                }
                req_stats.total_response_size += sample.bytes_received as u64;

                self.total_data_sent += sample.bytes_sent as u64;
                self.total_data_received += sample.bytes_received as u64;
            }
            Metric::Check { name, success } => {
                let entry = self.checks.entry(name).or_insert((0, 0));
                entry.0 += 1;
                if success {
                    entry.1 += 1;
                }
            }
            Metric::Iteration { duration, error } => {
                self.iterations += 1;
                self.iteration_duration.record(as_millis_f64(duration));
                if let Some(err) = error {
                    self.iteration_errors += 1;
                    *self.errors.entry(err).or_insert(0) += 1;
                }
            }
            Metric::Trend { name, value } => {
                self.trends.entry(name).or_default().record(value);
            }
            Metric::Counter { name, value } => {
                *self.counters.entry(name).or_insert(0.0) += value;
            }
            Metric::Gauge { name, value } => {
                self.gauges.insert(name, value);
            }
            Metric::Rate { name, success } => {
                let entry = self.rates.entry(name).or_insert((0, 0));
                entry.0 += 1;
                if success {
                    entry.1 += 1;
                }
            }
        }
    }

    /// Fold `other` into `self`. Every field merges with sum/min/max or an
    /// exact histogram add, so the order shards are merged in is irrelevant.
    pub fn merge_from(&mut self, other: &StatsAggregator) {
        self.total_requests += other.total_requests;
        self.failed_requests += other.failed_requests;
        self.http_duration.merge(&other.http_duration);
        self.total_data_sent += other.total_data_sent;
        self.total_data_received += other.total_data_received;
        self.iterations += other.iterations;
        self.iteration_errors += other.iteration_errors;
        self.iteration_duration.merge(&other.iteration_duration);

        for (code, count) in &other.status_codes {
            *self.status_codes.entry(*code).or_insert(0) += count;
        }
        for (err, count) in &other.errors {
            *self.errors.entry(err.clone()).or_insert(0) += count;
        }
        for (name, (total, passes)) in &other.checks {
            let entry = self.checks.entry(name.clone()).or_insert((0, 0));
            entry.0 += total;
            entry.1 += passes;
        }
        for (name, stats) in &other.requests {
            let merged = self.requests.entry(name.clone()).or_default();
            merged.total_requests += stats.total_requests;
            merged.failed_requests += stats.failed_requests;
            merged.duration.merge(&stats.duration);
            merged.total_response_size += stats.total_response_size;
        }
        for (name, trend) in &other.trends {
            self.trends.entry(name.clone()).or_default().merge(trend);
        }
        for (name, (total, success)) in &other.rates {
            let entry = self.rates.entry(name.clone()).or_insert((0, 0));
            entry.0 += total;
            entry.1 += success;
        }
        for (name, val) in &other.counters {
            *self.counters.entry(name.clone()).or_insert(0.0) += val;
        }
        // Gauges are last-write-wins; across shards the larger value is kept
        // so the merge stays order-independent.
        for (name, val) in &other.gauges {
            let entry = self.gauges.entry(name.clone()).or_insert(*val);
            *entry = entry.max(*val);
        }
    }

    /// Passed / total over every named check.
    pub fn checks_totals(&self) -> (usize, usize) {
        self.checks
            .values()
            .fold((0, 0), |(t, p), (total, passes)| (t + total, p + passes))
    }

    /// Resolve a metric by name. Built-in names shadow custom ones.
    pub fn metric(&self, name: &str) -> Option<MetricView<'_>> {
        match name {
            HTTP_REQS => Some(MetricView::Counter(self.total_requests as f64)),
            HTTP_REQ_FAILED => Some(MetricView::Rate {
                total: self.total_requests,
                success: self.failed_requests,
            }),
            HTTP_REQ_DURATION => Some(MetricView::Trend(&self.http_duration)),
            CHECKS => {
                let (total, passes) = self.checks_totals();
                Some(MetricView::Rate {
                    total,
                    success: passes,
                })
            }
            ITERATIONS => Some(MetricView::Counter(self.iterations as f64)),
            ITERATION_ERRORS => Some(MetricView::Counter(self.iteration_errors as f64)),
            ITERATION_DURATION => Some(MetricView::Trend(&self.iteration_duration)),
            _ => {
                if let Some(v) = self.counters.get(name) {
                    Some(MetricView::Counter(*v))
                } else if let Some(&(total, success)) = self.rates.get(name) {
                    Some(MetricView::Rate { total, success })
                } else if let Some(t) = self.trends.get(name) {
                    Some(MetricView::Trend(t))
                } else {
                    self.gauges.get(name).map(|v| MetricView::Gauge(*v))
                }
            }
        }
    }

    pub fn to_report(&self) -> ReportStats {
        let grouped_requests = self
            .requests
            .iter()
            .map(|(name, stats)| {
                let avg_response_size = if stats.total_requests > 0 {
                    stats.total_response_size as f64 / stats.total_requests as f64
                } else {
                    0.0
                };
                (
                    name.clone(),
                    RequestReport {
                        total_requests: stats.total_requests,
                        failed_requests: stats.failed_requests,
                        duration_ms: stats.duration.to_report(),
                        avg_response_size,
                    },
                )
            })
            .collect();

        let (check_total, check_passes) = self.checks_totals();

        ReportStats {
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            http_req_failed_rate: RateReport::new(self.total_requests, self.failed_requests).rate,
            http_req_duration: self.http_duration.to_report(),
            status_codes: self.status_codes.iter().map(|(k, v)| (*k, *v)).collect(),
            errors: self.errors.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            checks: self.checks.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            checks_rate: RateReport::new(check_total, check_passes).rate,
            grouped_requests,
            iterations: self.iterations,
            iteration_errors: self.iteration_errors,
            iteration_duration: self.iteration_duration.to_report(),
            total_data_sent: self.total_data_sent,
            total_data_received: self.total_data_received,
            trends: self
                .trends
                .iter()
                .map(|(k, t)| (k.clone(), t.to_report()))
                .collect(),
            rates: self
                .rates
                .iter()
                .map(|(k, &(total, success))| (k.clone(), RateReport::new(total, success)))
                .collect(),
            counters: self.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            gauges: self.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

impl ReportStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print(&self) {
        println!("\n--- Test Summary ---");

        if self.total_requests == 0
            && self.iterations == 0
            && self.checks.is_empty()
            && self.counters.is_empty()
            && self.trends.is_empty()
            && self.rates.is_empty()
        {
            println!("No metrics collected.");
            return;
        }

        if self.total_requests > 0 {
            let d = &self.http_req_duration;
            println!("HTTP Requests:  {}", self.total_requests);
            println!(
                "Failed:         {} ({:.2}%)",
                self.failed_requests,
                self.http_req_failed_rate * 100.0
            );
            println!("Avg Latency:    {:.2} ms", d.avg);
            println!("Min Latency:    {:.2} ms", d.min);
            println!("Max Latency:    {:.2} ms", d.max);
            println!("P50 Latency:    {:.2} ms", d.med);
            println!("P90 Latency:    {:.2} ms", d.p90);
            println!("P95 Latency:    {:.2} ms", d.p95);
            println!("P99 Latency:    {:.2} ms", d.p99);

            println!("\nStatus Codes:");
            for (code, count) in &self.status_codes {
                println!("  {}: {}", code, count);
            }

            let mb_sent = self.total_data_sent as f64 / 1_048_576.0;
            let mb_recv = self.total_data_received as f64 / 1_048_576.0;
            println!("\nData Transfer:");
            println!("  Sent:     {:.2} MB", mb_sent);
            println!("  Received: {:.2} MB", mb_recv);
        }

        println!(
            "\nIterations:     {} ({} errored, avg {:.2} ms)",
            self.iterations, self.iteration_errors, self.iteration_duration.avg
        );

        if !self.grouped_requests.is_empty() {
            println!("\nGrouped Requests:");
            for (name, stats) in &self.grouped_requests {
                println!("  Request: {}", name);
                println!("    Count: {}", stats.total_requests);
                println!("    P95:   {:.2} ms", stats.duration_ms.p95);
                if stats.failed_requests > 0 {
                    println!("    Failed: {}", stats.failed_requests);
                }
            }
        }

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for (err, count) in &self.errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.checks.is_empty() {
            println!("\nChecks: {:.2}%", self.checks_rate * 100.0);
            for (name, (total, passes)) in &self.checks {
                let fail = total - passes;
                if fail > 0 {
                    let percent = (*passes as f64 / *total as f64) * 100.0;
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        name, percent, passes, fail
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", name, passes);
                }
            }
        }

        if !self.trends.is_empty() {
            println!("\nTrends:");
            for (name, t) in &self.trends {
                println!(
                    "  {}: avg={:.2}, p95={:.2}, p99={:.2}, count={}",
                    name, t.avg, t.p95, t.p99, t.count
                );
            }
        }

        if !self.counters.is_empty() {
            println!("\nCounters:");
            for (name, val) in &self.counters {
                println!("  {}: {}", name, val);
            }
        }

        if !self.rates.is_empty() {
            println!("\nRates:");
            for (name, r) in &self.rates {
                println!("  {}: {:.2}% ({}/{})", name, r.rate * 100.0, r.success, r.total);
            }
        }

        if !self.gauges.is_empty() {
            println!("\nGauges:");
            for (name, val) in &self.gauges {
                println!("  {}: {:.2}", name, val);
            }
        }
    }
}

/// Sharded aggregator for reduced lock contention at high concurrency.
/// Each virtual user writes to shard `vu_id % num_shards`; readers merge all
/// shards into a fresh aggregator without touching the shards themselves.
pub struct ShardedAggregator {
    shards: Vec<Mutex<StatsAggregator>>,
}

pub type SharedAggregator = Arc<ShardedAggregator>;

impl ShardedAggregator {
    pub fn new(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| Mutex::new(StatsAggregator::new()))
            .collect();
        Self { shards }
    }

    /// Shard count scaled to the expected number of virtual users:
    /// roughly 100 users per shard, between 16 and 256 shards.
    pub fn for_workers(total_workers: usize) -> Self {
        Self::new((total_workers / 100).clamp(16, 256))
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn add(&self, shard: usize, metric: Metric) {
        self.shards[shard % self.shards.len()].lock().add(metric);
    }

    pub fn record_sample(&self, shard: usize, sample: RequestSample) {
        self.add(shard, Metric::Request(sample));
    }

    pub fn record_check(&self, shard: usize, name: &str, passed: bool) {
        self.add(
            shard,
            Metric::Check {
                name: name.to_string(),
                success: passed,
            },
        );
    }

    pub fn record_counter(&self, shard: usize, name: &str, delta: f64) {
        self.add(
            shard,
            Metric::Counter {
                name: name.to_string(),
                value: delta,
            },
        );
    }

    pub fn record_rate(&self, shard: usize, name: &str, success: bool) {
        self.add(
            shard,
            Metric::Rate {
                name: name.to_string(),
                success,
            },
        );
    }

    pub fn record_trend(&self, shard: usize, name: &str, value: f64) {
        self.add(
            shard,
            Metric::Trend {
                name: name.to_string(),
                value,
            },
        );
    }

    pub fn record_iteration(&self, shard: usize, duration: Duration, error: Option<String>) {
        self.add(shard, Metric::Iteration { duration, error });
    }

    /// Gauges are engine-level values; they always live in shard 0 so the
    /// last write wins.
    pub fn record_gauge(&self, name: &str, value: f64) {
        self.add(
            0,
            Metric::Gauge {
                name: name.to_string(),
                value,
            },
        );
    }

    /// Merge all shards into a single aggregator. Read-only: calling it twice
    /// without writes in between yields identical results.
    pub fn snapshot(&self) -> StatsAggregator {
        let mut merged = StatsAggregator::new();
        for shard in &self.shards {
            merged.merge_from(&shard.lock());
        }
        merged
    }
}
