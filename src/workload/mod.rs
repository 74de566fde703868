//! Per-iteration logic run by every virtual user, and the context it runs in.

pub mod flow;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use http::Method;

use crate::engine::http_client::{HttpExecutor, HttpResponse, RequestSpec};
use crate::stats::{RequestSample, SharedAggregator};

pub const HARD_STOP_ERROR: &str = "request interrupted by hard stop";

/// One iteration of a test scenario. Errors and panics are caught by the
/// virtual user loop and recorded as `iteration_errors`; they never stop the
/// user or the run.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn iteration(&self, vu: &mut VuContext) -> anyhow::Result<()>;
}

pub type SharedWorkload = Arc<dyn Workload>;

/// Named workloads a run plan can reference through `exec`.
#[derive(Default, Clone)]
pub struct WorkloadRegistry {
    workloads: HashMap<String, SharedWorkload>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, workload: SharedWorkload) {
        self.workloads.insert(name.into(), workload);
    }

    pub fn get(&self, name: &str) -> Option<SharedWorkload> {
        self.workloads.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workloads.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workloads.keys().map(String::as_str)
    }
}

/// Everything the virtual users of a run share.
pub struct RunContext {
    pub base_url: String,
    pub headers: HeaderMap,
    pub executor: HttpExecutor,
    pub metrics: SharedAggregator,
}

/// Handle a workload uses to talk to the harness. One per virtual user,
/// reused across its iterations.
pub struct VuContext {
    vu_id: u64,
    iteration: u64,
    scenario: Arc<str>,
    run: Arc<RunContext>,
}

impl VuContext {
    pub fn new(vu_id: u64, scenario: Arc<str>, run: Arc<RunContext>) -> Self {
        Self {
            vu_id,
            iteration: 0,
            scenario,
            run,
        }
    }

    /// 1-based id, unique within the run.
    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// 0-based iteration counter of this virtual user.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn base_url(&self) -> &str {
        &self.run.base_url
    }

    fn shard(&self) -> usize {
        self.vu_id as usize
    }

    /// Absolute URLs pass through; anything else is appended to the base URL.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.run.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn get(&self, path: &str) -> HttpResponse {
        self.request(RequestSpec::new(Method::GET, self.url(path)))
            .await
    }

    pub async fn post_json(&self, path: &str, body: &serde_json::Value) -> HttpResponse {
        let spec = RequestSpec::new(Method::POST, self.url(path))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body.to_string());
        self.request(spec).await
    }

    /// Execute a request with the run's default headers (request headers win)
    /// and record its sample.
    pub async fn request(&self, mut spec: RequestSpec) -> HttpResponse {
        for (name, value) in &self.run.headers {
            if !spec.headers.contains_key(name) {
                spec.headers.insert(name.clone(), value.clone());
            }
        }

        let mut guard = InFlight {
            metrics: &self.run.metrics,
            shard: self.shard(),
            tag: spec.tag.clone().unwrap_or_else(|| spec.url.clone()),
            method: spec.method.to_string(),
            start: Instant::now(),
            armed: true,
        };
        let response = self.run.executor.execute(spec).await;
        guard.armed = false;

        self.run
            .metrics
            .record_sample(self.shard(), response.sample.clone());
        response
    }

    /// Record a named check and hand the outcome back.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.run.metrics.record_check(self.shard(), name, passed);
        passed
    }

    pub fn counter(&self, name: &str) -> CounterHandle<'_> {
        CounterHandle { vu: self, name: name.to_string() }
    }

    pub fn rate(&self, name: &str) -> RateHandle<'_> {
        RateHandle { vu: self, name: name.to_string() }
    }

    pub fn trend(&self, name: &str) -> TrendHandle<'_> {
        TrendHandle { vu: self, name: name.to_string() }
    }

    pub fn gauge(&self, name: &str) -> GaugeHandle<'_> {
        GaugeHandle { vu: self, name: name.to_string() }
    }

    /// Think time.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct CounterHandle<'a> {
    vu: &'a VuContext,
    name: String,
}

impl CounterHandle<'_> {
    pub fn add(&self, delta: f64) {
        self.vu.run.metrics.record_counter(self.vu.shard(), &self.name, delta);
    }
}

pub struct RateHandle<'a> {
    vu: &'a VuContext,
    name: String,
}

impl RateHandle<'_> {
    pub fn add(&self, success: bool) {
        self.vu.run.metrics.record_rate(self.vu.shard(), &self.name, success);
    }
}

pub struct TrendHandle<'a> {
    vu: &'a VuContext,
    name: String,
}

impl TrendHandle<'_> {
    pub fn add(&self, value: f64) {
        self.vu.run.metrics.record_trend(self.vu.shard(), &self.name, value);
    }
}

pub struct GaugeHandle<'a> {
    vu: &'a VuContext,
    name: String,
}

impl GaugeHandle<'_> {
    pub fn set(&self, value: f64) {
        self.vu.run.metrics.record_gauge(&self.name, value);
    }
}

/// Records an error sample if the request future is dropped before the
/// response arrives, which only happens when the engine aborts the task.
struct InFlight<'a> {
    metrics: &'a SharedAggregator,
    shard: usize,
    tag: String,
    method: String,
    start: Instant,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let elapsed = self.start.elapsed();
        let started_at = Utc::now()
            - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        let tag = url::Url::parse(&self.tag)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| std::mem::take(&mut self.tag));
        self.metrics.record_sample(
            self.shard,
            RequestSample {
                endpoint_tag: tag,
                method: std::mem::take(&mut self.method),
                started_at,
                duration: elapsed,
                status: None,
                error: Some(HARD_STOP_ERROR.to_string()),
                bytes_sent: 0,
                bytes_received: 0,
            },
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stats::ShardedAggregator;

    pub(crate) fn run_context(base_url: &str) -> Arc<RunContext> {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("application/json"));
        Arc::new(RunContext {
            base_url: base_url.to_string(),
            headers,
            executor: HttpExecutor::new().unwrap(),
            metrics: Arc::new(ShardedAggregator::new(4)),
        })
    }

    #[test]
    fn test_url_joining() {
        let vu = VuContext::new(1, Arc::from("default"), run_context("http://localhost:8091/"));
        assert_eq!(vu.url("/products"), "http://localhost:8091/products");
        assert_eq!(vu.url("products"), "http://localhost:8091/products");
        assert_eq!(vu.url("https://other.test/x"), "https://other.test/x");

        let vu = VuContext::new(1, Arc::from("default"), run_context("http://host/api"));
        assert_eq!(vu.url("/users/me"), "http://host/api/users/me");
    }

    #[test]
    fn test_metric_handles_record() {
        let run = run_context("http://localhost");
        let vu = VuContext::new(3, Arc::from("default"), run.clone());
        assert!(vu.check("ok", true));
        assert!(!vu.check("ok", false));
        vu.counter("orders").add(2.0);
        vu.rate("hits").add(true);
        vu.trend("latency").add(12.0);
        vu.gauge("queue").set(4.0);

        let report = run.metrics.snapshot().to_report();
        assert_eq!(report.checks["ok"], (2, 1));
        assert_eq!(report.counters["orders"], 2.0);
        assert_eq!(report.rates["hits"].success, 1);
        assert_eq!(report.trends["latency"].count, 1);
        assert_eq!(report.gauges["queue"], 4.0);
    }

    #[tokio::test]
    async fn test_dropped_request_is_recorded() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let run = run_context(&format!("http://{}", addr));
        let task_run = run.clone();
        let task = tokio::spawn(async move {
            let vu = VuContext::new(1, Arc::from("default"), task_run);
            vu.get("/slow").await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        let _ = task.await;

        let report = run.metrics.snapshot().to_report();
        assert_eq!(report.total_requests, 1);
        assert_eq!(report.errors.get(HARD_STOP_ERROR), Some(&1));
        assert!(report.grouped_requests.contains_key("/slow"));
    }
}
