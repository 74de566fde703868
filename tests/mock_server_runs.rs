//! End-to-end runs against an in-process mock API.
//!
//! Each test starts an axum server on an ephemeral port, builds a run from a
//! YAML test file and checks the final summary and verdicts.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use barrage::cli::config::{check_workloads, Config};
use barrage::engine::pool::ITERATION_CHECK;
use barrage::engine::Engine;
use barrage::stats::thresholds::{self, ThresholdSpec, Verdict};
use barrage::stats::{RequestSample, ShardedAggregator};
use barrage::workload::{VuContext, Workload, WorkloadRegistry};

const PRODUCT_ID: &str = "01HQPRODUCT";

#[derive(Clone, Default)]
struct MockState {
    hits: Arc<AtomicU64>,
    carts: Arc<AtomicU64>,
}

async fn status() -> Json<Value> {
    Json(json!({ "version": "5.0", "app_name": "mock shop" }))
}

/// Every 50th request answers 500.
async fn flaky(State(state): State<MockState>) -> StatusCode {
    let n = state.hits.fetch_add(1, Ordering::Relaxed);
    if n % 50 == 49 {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn register(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::CREATED,
        Json(json!({ "id": "u1", "email": body["email"] })),
    )
}

/// The token is the email, so `/users/me` can answer for whoever logged in.
async fn login(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "access_token": body["email"], "token_type": "bearer" }))
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn me(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    let email = bearer(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    Ok(Json(json!({ "id": "u1", "email": email, "first_name": "Load" })))
}

async fn products() -> Json<Value> {
    Json(json!({
        "current_page": 1,
        "data": [
            { "id": PRODUCT_ID, "name": "Combination Pliers", "price": 14.15 },
            { "id": "01HQOTHER", "name": "Pliers", "price": 12.01 }
        ]
    }))
}

async fn product(Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    if id == PRODUCT_ID {
        Ok(Json(
            json!({ "id": PRODUCT_ID, "name": "Combination Pliers", "price": 14.15 }),
        ))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn related(Path(_id): Path<String>) -> Json<Value> {
    Json(json!([{ "id": "01HQOTHER", "name": "Pliers" }]))
}

async fn create_cart(State(state): State<MockState>, headers: HeaderMap) -> Result<(StatusCode, Json<Value>), StatusCode> {
    bearer(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let n = state.carts.fetch_add(1, Ordering::Relaxed);
    Ok((StatusCode::CREATED, Json(json!({ "id": format!("cart{}", n) }))))
}

async fn add_to_cart(Path(_id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "result": "item added or updated", "product_id": body["product_id"] }))
}

async fn cart(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "id": id,
        "items": [{ "product_id": PRODUCT_ID, "quantity": 2 }]
    }))
}

async fn email_taken() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "email": ["A customer with this email address already exists."] })),
    )
}

async fn add_favorite() -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, Json(json!({ "id": "f1" })))
}

async fn favorites() -> Json<Value> {
    Json(json!([{ "product_id": PRODUCT_ID }]))
}

async fn start_mock() -> Result<(SocketAddr, MockState)> {
    let state = MockState::default();
    let app = Router::new()
        .route("/status", get(status))
        .route("/flaky", get(flaky))
        .route("/users/register", post(register))
        .route("/users/login", post(login))
        .route("/users/taken", post(email_taken))
        .route("/users/me", get(me))
        .route("/products", get(products))
        .route("/products/{id}", get(product))
        .route("/products/{id}/related", get(related))
        .route("/carts", post(create_cart))
        .route("/carts/{id}", get(cart).post(add_to_cart))
        .route("/favorites", get(favorites).post(add_favorite))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((addr, state))
}

fn base_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flow_run_passes_thresholds() -> Result<()> {
    let (addr, _) = start_mock().await?;
    let yaml = format!(
        r#"
base_url: {}
workers: 3
duration: 1s
stop: 5s
thresholds:
  http_req_duration: ["p(95)<500", "max<2000"]
  http_req_failed: ["rate<0.01"]
  checks: ["rate>0.95"]
  iterations: ["count>0"]
flows:
  browse:
    think_time: 20ms
    steps:
      - name: "{{{{path}}}}"
        paths: [/status, /products]
        checks:
          status: [200]
          max_duration: 1000ms
"#,
        base_url(addr)
    );
    let config = Config::parse(&yaml, false)?;
    let plan = config.to_plan()?;
    let registry = config.build_registry()?;
    check_workloads(&plan, &registry)?;

    let result = Engine::new().run(&plan, &registry).await?;

    assert!(result.passed, "{}", result.to_json());
    assert!(result.metrics.total_requests > 0);
    assert_eq!(result.metrics.failed_requests, 0);
    assert_eq!(result.metrics.checks_rate, 1.0);
    assert_eq!(result.metrics.status_codes.get(&200), Some(&result.metrics.total_requests));
    assert!(result.metrics.grouped_requests.contains_key("/status"));
    assert!(result.metrics.grouped_requests.contains_key("/products"));
    assert!(result.verdicts.values().all(|v| *v == Verdict::Pass));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_percent_failures_breach_one_percent_threshold() -> Result<()> {
    let (addr, _) = start_mock().await?;
    let yaml = format!(
        r#"
base_url: {}
workers: 2
iterations: 50
thresholds:
  http_req_failed: ["rate<0.01", "rate<0.05"]
flows:
  flaky:
    steps:
      - name: flaky
        path: /flaky
"#,
        base_url(addr)
    );
    let config = Config::parse(&yaml, false)?;
    let plan = config.to_plan()?;
    let registry = config.build_registry()?;

    let result = Engine::new().run(&plan, &registry).await?;

    assert_eq!(result.metrics.total_requests, 100);
    assert_eq!(result.metrics.failed_requests, 2);
    assert!((result.metrics.http_req_failed_rate - 0.02).abs() < 1e-9);
    assert!(!result.passed);
    assert!(!result.aborted_on_threshold);
    assert_eq!(result.verdicts["http_req_failed"], Verdict::Fail);

    let failures: Vec<_> = result.thresholds.failures().map(|o| o.expression.as_str()).collect();
    assert_eq!(failures, vec!["rate<0.01"]);
    Ok(())
}

#[test]
fn test_failure_rate_threshold_over_recorded_samples() {
    let stats = ShardedAggregator::new(4);
    for i in 0..100u16 {
        let status = if i == 10 || i == 60 { 503 } else { 200 };
        stats.record_sample(
            usize::from(i),
            RequestSample {
                endpoint_tag: "/status".to_string(),
                method: "GET".to_string(),
                started_at: chrono::Utc::now(),
                duration: Duration::from_millis(5),
                status: Some(status),
                error: None,
                bytes_sent: 0,
                bytes_received: 64,
            },
        );
    }

    let specs = vec![
        ThresholdSpec::parse("http_req_failed", "rate<0.01").unwrap(),
        ThresholdSpec::parse("http_reqs", "count==100").unwrap(),
    ];
    let evaluation = thresholds::evaluate(&specs, &stats.snapshot());

    assert!(!evaluation.passed());
    assert_eq!(evaluation.outcomes[0].observed, Some(0.02));
    assert!(!evaluation.outcomes[0].passed);
    assert!(evaluation.outcomes[1].passed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_system_workflow_against_mock_shop() -> Result<()> {
    let (addr, _) = start_mock().await?;
    let mut config = Config::parse(include_str!("../scenarios/system.yaml"), false)?;
    config.base_url = Some(base_url(addr));
    for scenario in config.scenarios.iter_mut().flat_map(|s| s.values_mut()) {
        scenario.schedule = None;
        scenario.workers = Some(2);
        scenario.duration = Some("1s".to_string());
    }
    for flow in config.flows.iter_mut().flat_map(|f| f.values_mut()) {
        flow.think_time = Some("10ms".to_string());
    }
    config.stop = Some("5s".to_string());

    let plan = config.to_plan()?;
    let registry = config.build_registry()?;
    check_workloads(&plan, &registry)?;
    let result = Engine::new().run(&plan, &registry).await?;

    let metrics = &result.metrics;
    assert!(result.passed, "{}", result.to_json());
    assert!(metrics.counters["system_workflow_passed"] > 0.0);
    assert!(!metrics.counters.contains_key("system_workflow_failed"));
    assert!(!metrics.counters.contains_key("integration_errors"));
    assert!(!metrics.counters.contains_key("data_consistency_errors"));
    assert_eq!(metrics.failed_requests, 0);
    assert!(metrics.grouped_requests.contains_key("login"));
    assert!(metrics.grouped_requests.contains_key("related products"));
    assert_eq!(metrics.checks_rate, 1.0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_system_workflow_counts_consistency_errors() -> Result<()> {
    let (addr, _) = start_mock().await?;
    let yaml = format!(
        r#"
base_url: {}
workers: 1
iterations: 3
thresholds:
  data_consistency_errors: ["count==0"]
flows:
  consistency:
    on_failure: [system_workflow_failed]
    steps:
      - name: products
        path: /products
        capture:
          product_id: data.1.id
      - name: product consistency
        path: "/products/{{{{product_id}}}}"
        checks:
          status: [200]
        on_failure: {{ counters: [data_consistency_errors], abort: true }}
      - name: never reached
        path: /status
"#,
        base_url(addr)
    );
    let config = Config::parse(&yaml, false)?;
    let plan = config.to_plan()?;
    let registry = config.build_registry()?;
    let result = Engine::new().run(&plan, &registry).await?;

    let metrics = &result.metrics;
    assert_eq!(metrics.iterations, 3);
    assert_eq!(metrics.counters["data_consistency_errors"], 3.0);
    assert_eq!(metrics.counters["system_workflow_failed"], 3.0);
    assert!(!metrics.grouped_requests.contains_key("never reached"));
    assert_eq!(metrics.status_codes.get(&404), Some(&3));
    assert!(!result.passed);
    Ok(())
}

/// Fails every third iteration without touching the network.
struct Unreliable;

#[async_trait]
impl Workload for Unreliable {
    async fn iteration(&self, vu: &mut VuContext) -> Result<()> {
        if vu.iteration() % 3 == 2 {
            anyhow::bail!("simulated failure in vu {}", vu.vu_id());
        }
        let response = vu.get("/status").await;
        vu.check("status is 200", response.status() == Some(200));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_iteration_errors_do_not_stop_other_workers() -> Result<()> {
    let (addr, _) = start_mock().await?;
    let yaml = format!(
        "base_url: {}\nworkers: 3\niterations: 6\nexec: unreliable\n",
        base_url(addr)
    );
    let config = Config::parse(&yaml, false)?;
    let plan = config.to_plan()?;
    let mut registry = WorkloadRegistry::new();
    registry.register("unreliable", Arc::new(Unreliable));

    let result = Engine::new().run(&plan, &registry).await?;

    let metrics = &result.metrics;
    assert_eq!(metrics.iterations, 18);
    assert_eq!(metrics.iteration_errors, 6);
    assert_eq!(metrics.total_requests, 12);
    assert_eq!(metrics.failed_requests, 0);
    assert_eq!(metrics.checks["status is 200"], (12, 12));
    assert_eq!(metrics.checks[ITERATION_CHECK], (6, 0));
    assert!((metrics.checks_rate - 12.0 / 18.0).abs() < 1e-9);
    assert!(result.passed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_iteration_errors_fail_checks_threshold() -> Result<()> {
    let (addr, _) = start_mock().await?;
    let yaml = format!(
        "base_url: {}\nworkers: 1\niterations: 5\nexec: unreliable\nthresholds:\n  checks: [\"rate>0.95\"]\n",
        base_url(addr)
    );
    let config = Config::parse(&yaml, false)?;
    let plan = config.to_plan()?;
    let mut registry = WorkloadRegistry::new();
    registry.register("unreliable", Arc::new(Unreliable));

    let result = Engine::new().run(&plan, &registry).await?;

    // iteration index 2 fails, the other four pass their check
    assert_eq!(result.metrics.iteration_errors, 1);
    assert_eq!(result.metrics.checks_rate, 0.8);
    assert_eq!(result.verdicts["checks"], Verdict::Fail);
    assert!(!result.passed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tolerated_status_still_records_checks() -> Result<()> {
    let (addr, _) = start_mock().await?;
    let yaml = format!(
        r#"
base_url: {}
workers: 1
iterations: 4
flows:
  signup:
    on_success: [signup_passed]
    steps:
      - name: register
        method: POST
        path: /users/taken
        body: {{ email: "someone@test.com" }}
        tolerate_status: [422]
        checks:
          status: [201]
        on_failure: {{ counters: [integration_errors], abort: true }}
      - name: status
        path: /status
        checks:
          status: [200]
"#,
        base_url(addr)
    );
    let config = Config::parse(&yaml, false)?;
    let plan = config.to_plan()?;
    let registry = config.build_registry()?;
    let result = Engine::new().run(&plan, &registry).await?;

    let metrics = &result.metrics;
    assert_eq!(metrics.checks["register returns 201"], (4, 0));
    assert_eq!(metrics.checks["status returns 200"], (4, 4));
    assert_eq!(metrics.checks_rate, 0.5);
    assert!(!metrics.counters.contains_key("integration_errors"));
    assert_eq!(metrics.counters["signup_passed"], 4.0);
    assert_eq!(metrics.status_codes.get(&422), Some(&4));
    Ok(())
}
