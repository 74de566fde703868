use anyhow::Result;
use http::HeaderMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::stats::thresholds::{self, Evaluation, ThresholdSpec, Verdict};
use crate::stats::{ReportStats, ShardedAggregator, VUS, VUS_MAX};
use crate::workload::{RunContext, WorkloadRegistry};

pub mod control;
pub mod http_client;
pub mod pool;
pub mod scheduler;

use control::{ControlState, RunPhase, StopReason};
use http_client::HttpExecutor;
use pool::{IterationLimits, VirtualUserPool};
use scheduler::RampProfile;

const TICK: Duration = Duration::from_millis(100);
const INTERIM_EVAL_EVERY: Duration = Duration::from_secs(1);
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// One independently scheduled group of virtual users.
#[derive(Debug, Clone)]
pub struct ScenarioPlan {
    pub name: String,
    /// Name of the workload in the registry.
    pub exec: String,
    pub profile: RampProfile,
    /// Offset from the start of the run.
    pub start_time: Duration,
    pub limits: IterationLimits,
}

impl ScenarioPlan {
    pub fn end_time(&self) -> Duration {
        self.start_time + self.profile.total_duration()
    }
}

/// Validated, ready-to-run description of a test.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub base_url: String,
    pub headers: HeaderMap,
    pub scenarios: Vec<ScenarioPlan>,
    pub thresholds: Vec<ThresholdSpec>,
    /// Stop the run as soon as a threshold breaches.
    pub abort_on_fail: bool,
    /// No interim evaluation before this much time has passed.
    pub delay_abort_eval: Duration,
    pub graceful_stop: Duration,
    pub request_timeout: Duration,
}

impl RunPlan {
    pub fn total_duration(&self) -> Duration {
        self.scenarios
            .iter()
            .map(ScenarioPlan::end_time)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Upper bound on concurrent users, assuming all scenarios peak together.
    pub fn peak_workers(&self) -> usize {
        self.scenarios.iter().map(|s| s.profile.peak()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub passed: bool,
    pub aborted_on_threshold: bool,
    pub stop_reason: Option<StopReason>,
    pub elapsed_secs: f64,
    pub thresholds: Evaluation,
    pub verdicts: BTreeMap<String, Verdict>,
    pub phases: Vec<(RunPhase, f64)>,
    pub metrics: ReportStats,
}

impl RunResult {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print(&self) {
        self.metrics.print();
        self.thresholds.print();
        println!("\nDuration: {:.1}s", self.elapsed_secs);
        if self.aborted_on_threshold {
            println!("Run stopped early: threshold breached.");
        }
        if self.passed {
            println!("Result: PASSED");
        } else {
            println!("Result: FAILED");
        }
    }
}

pub struct Engine {
    control: Arc<ControlState>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            control: Arc::new(ControlState::new()),
        }
    }

    /// Shared control handle, e.g. to stop the run from a signal handler.
    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    /// Run `plan` to completion. Only configuration problems (unknown workload,
    /// HTTP client setup) are returned as errors; everything that goes wrong
    /// during the run ends up in the metrics.
    pub async fn run(&self, plan: &RunPlan, registry: &WorkloadRegistry) -> Result<RunResult> {
        let control = &self.control;
        control.begin_run();

        let mut workloads = Vec::with_capacity(plan.scenarios.len());
        for scenario in &plan.scenarios {
            match registry.get(&scenario.exec) {
                Some(w) => workloads.push(w),
                None => {
                    control.transition(RunPhase::Aborted);
                    return Err(ConfigError::UnknownWorkload {
                        scenario: scenario.name.clone(),
                        exec: scenario.exec.clone(),
                    }
                    .into());
                }
            }
        }

        let peak = plan.peak_workers();
        let executor = match HttpExecutor::with_pool_and_workers(
            peak.max(1),
            peak,
            plan.request_timeout,
        ) {
            Ok(e) => e,
            Err(e) => {
                control.transition(RunPhase::Aborted);
                return Err(e);
            }
        };
        let metrics = Arc::new(ShardedAggregator::for_workers(peak));
        let run = Arc::new(RunContext {
            base_url: plan.base_url.clone(),
            headers: plan.headers.clone(),
            executor,
            metrics: metrics.clone(),
        });

        let ids = Arc::new(AtomicU64::new(0));
        let mut pools: Vec<VirtualUserPool> = plan
            .scenarios
            .iter()
            .zip(workloads)
            .map(|(s, w)| VirtualUserPool::new(&s.name, w, run.clone(), ids.clone(), s.limits))
            .collect();

        info!(
            scenarios = plan.scenarios.len(),
            peak_workers = peak,
            shards = metrics.num_shards(),
            duration = ?plan.total_duration(),
            "Starting run"
        );

        let start = Instant::now();
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_eval = start;
        let mut started = vec![false; pools.len()];
        let mut finished = vec![false; pools.len()];
        let mut vus_max = 0usize;

        loop {
            ticker.tick().await;
            let elapsed = start.elapsed();
            if control.is_stopped() {
                break;
            }

            let mut ramping = false;
            let mut target = 0usize;
            for (idx, (scenario, pool)) in plan.scenarios.iter().zip(pools.iter_mut()).enumerate() {
                if finished[idx] || elapsed < scenario.start_time {
                    continue;
                }
                let local = elapsed - scenario.start_time;
                if !started[idx] {
                    started[idx] = true;
                    info!(scenario = %scenario.name, exec = %scenario.exec, "Scenario started");
                }
                if local >= scenario.profile.total_duration() || pool.exhausted() {
                    finished[idx] = true;
                    pool.stop_all();
                    info!(scenario = %scenario.name, "Scenario complete");
                    continue;
                }

                let desired = scenario.profile.concurrency_at(local);
                pool.reconcile(desired);
                target += desired;
                if let Some((stage, from)) = scenario.profile.stage_at(local) {
                    ramping |= scenario.profile.stages()[stage].target != from;
                }
            }

            if finished.iter().all(|f| *f) {
                break;
            }

            let previous = control.set_target_workers(target);
            if previous != target {
                debug!(from = previous, to = target, "Target workers changed");
            }
            control.transition(if ramping {
                RunPhase::Ramping
            } else {
                RunPhase::Steady
            });

            let live: usize = pools.iter().map(VirtualUserPool::live).sum();
            vus_max = vus_max.max(live);
            metrics.record_gauge(VUS, live as f64);
            metrics.record_gauge(VUS_MAX, vus_max as f64);

            if plan.abort_on_fail
                && !plan.thresholds.is_empty()
                && elapsed >= plan.delay_abort_eval
                && last_eval.elapsed() >= INTERIM_EVAL_EVERY
            {
                last_eval = Instant::now();
                let interim = thresholds::evaluate(&plan.thresholds, &metrics.snapshot());
                if !interim.passed() {
                    let breached: Vec<String> = interim
                        .failures()
                        .map(|o| format!("{}: {}", o.metric, o.expression))
                        .collect();
                    warn!(breached = ?breached, "Threshold breached, stopping run");
                    control.stop(StopReason::ThresholdBreach(breached.join(", ")));
                }
            }
        }

        // A stop before the first tick leaves us in Configuring, which may go
        // straight to Draining.
        control.transition(RunPhase::Draining);
        let deadline = Instant::now() + plan.graceful_stop;
        let mut still_running = 0;
        for pool in pools.iter_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            still_running += pool.drain(remaining).await;
        }
        if still_running > 0 {
            warn!(
                remaining = still_running,
                graceful_stop = ?plan.graceful_stop,
                "Graceful stop expired"
            );
            for pool in pools.iter_mut() {
                pool.abort_all().await;
            }
        }
        metrics.record_gauge(VUS, 0.0);
        control.transition(RunPhase::Completed);

        let elapsed = start.elapsed();
        let snapshot = metrics.snapshot();
        let evaluation = thresholds::evaluate(&plan.thresholds, &snapshot);
        let stop_reason = control.stop_reason();
        debug!(elapsed = ?elapsed, passed = evaluation.passed(), "Run finished");

        Ok(RunResult {
            passed: evaluation.passed(),
            aborted_on_threshold: matches!(stop_reason, Some(StopReason::ThresholdBreach(_))),
            stop_reason,
            elapsed_secs: elapsed.as_secs_f64(),
            verdicts: evaluation.verdicts(),
            thresholds: evaluation,
            phases: control
                .history()
                .into_iter()
                .map(|(p, at)| (p, at.as_secs_f64()))
                .collect(),
            metrics: snapshot.to_report(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{VuContext, Workload};
    use async_trait::async_trait;
    use scheduler::{Interpolation, Stage};

    struct Busy;

    #[async_trait]
    impl Workload for Busy {
        async fn iteration(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            vu.counter("work").add(1.0);
            vu.sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl Workload for Stuck {
        async fn iteration(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            vu.sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn registry() -> WorkloadRegistry {
        let mut r = WorkloadRegistry::new();
        r.register("busy", Arc::new(Busy));
        r.register("stuck", Arc::new(Stuck));
        r
    }

    fn plan(exec: &str, profile: RampProfile) -> RunPlan {
        RunPlan {
            base_url: "http://127.0.0.1:9".to_string(),
            headers: HeaderMap::new(),
            scenarios: vec![ScenarioPlan {
                name: "default".to_string(),
                exec: exec.to_string(),
                profile,
                start_time: Duration::ZERO,
                limits: IterationLimits::default(),
            }],
            thresholds: Vec::new(),
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
            graceful_stop: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn scenario(name: &str, exec: &str, profile: RampProfile, start_time: Duration) -> ScenarioPlan {
        ScenarioPlan {
            name: name.to_string(),
            exec: exec.to_string(),
            profile,
            start_time,
            limits: IterationLimits::default(),
        }
    }

    fn phases(result: &RunResult) -> Vec<RunPhase> {
        result.phases.iter().map(|(p, _)| *p).collect()
    }

    #[tokio::test]
    async fn test_constant_run_completes() {
        let engine = Engine::new();
        let p = plan("busy", RampProfile::constant(3, Duration::from_millis(500)));
        let result = engine.run(&p, &registry()).await.unwrap();

        assert!(result.passed);
        assert!(!result.aborted_on_threshold);
        assert!(result.metrics.iterations > 0);
        assert_eq!(result.metrics.iterations as f64, result.metrics.counters["work"]);
        assert_eq!(result.metrics.gauges[VUS_MAX], 3.0);
        assert_eq!(result.metrics.iteration_errors, 0);
        let seen = phases(&result);
        assert_eq!(seen.first(), Some(&RunPhase::Configuring));
        assert!(seen.contains(&RunPhase::Steady));
        assert_eq!(&seen[seen.len() - 2..], &[RunPhase::Draining, RunPhase::Completed]);
    }

    #[tokio::test]
    async fn test_ramping_phase_is_reported() {
        let engine = Engine::new();
        let profile = RampProfile::new(
            "default",
            vec![
                Stage::new(Duration::from_millis(300), 4),
                Stage::new(Duration::from_millis(300), 4),
            ],
            0,
            Interpolation::Linear,
        )
        .unwrap();
        let result = engine.run(&plan("busy", profile), &registry()).await.unwrap();
        let seen = phases(&result);
        let ramp = seen.iter().position(|p| *p == RunPhase::Ramping).unwrap();
        let steady = seen.iter().position(|p| *p == RunPhase::Steady).unwrap();
        assert!(ramp < steady);
    }

    #[tokio::test]
    async fn test_unknown_workload_aborts() {
        let engine = Engine::new();
        let p = plan("missing", RampProfile::constant(1, Duration::from_millis(100)));
        let err = engine.run(&p, &registry()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownWorkload { exec, .. }) if exec == "missing"
        ));
        assert_eq!(engine.control().phase(), RunPhase::Aborted);
    }

    #[tokio::test]
    async fn test_threshold_breach_stops_run_early() {
        let engine = Engine::new();
        let mut p = plan("busy", RampProfile::constant(2, Duration::from_secs(30)));
        p.thresholds = vec![ThresholdSpec::parse("work", "count==0").unwrap()];
        p.abort_on_fail = true;

        let result = engine.run(&p, &registry()).await.unwrap();
        assert!(!result.passed);
        assert!(result.aborted_on_threshold);
        assert!(result.elapsed_secs < 10.0);
        assert_eq!(result.verdicts["work"], Verdict::Fail);
    }

    #[tokio::test]
    async fn test_breach_without_abort_runs_to_end() {
        let engine = Engine::new();
        let mut p = plan("busy", RampProfile::constant(1, Duration::from_millis(300)));
        p.thresholds = vec![ThresholdSpec::parse("work", "count==0").unwrap()];

        let result = engine.run(&p, &registry()).await.unwrap();
        assert!(!result.passed);
        assert!(!result.aborted_on_threshold);
        assert!(result.elapsed_secs >= 0.3);
    }

    #[tokio::test]
    async fn test_graceful_stop_then_hard_stop() {
        let engine = Engine::new();
        let mut p = plan("stuck", RampProfile::constant(2, Duration::from_millis(200)));
        p.graceful_stop = Duration::from_millis(200);

        let result = engine.run(&p, &registry()).await.unwrap();
        assert!(result.elapsed_secs < 5.0);
        // aborted iterations never complete
        assert_eq!(result.metrics.iterations, 0);
        assert_eq!(engine.control().phase(), RunPhase::Completed);
    }

    #[tokio::test]
    async fn test_external_stop() {
        let engine = Engine::new();
        let control = engine.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            control.stop(StopReason::Interrupted);
        });
        let p = plan("busy", RampProfile::constant(1, Duration::from_secs(60)));
        let result = engine.run(&p, &registry()).await.unwrap();
        assert_eq!(result.stop_reason, Some(StopReason::Interrupted));
        assert!(result.elapsed_secs < 10.0);
        assert!(result.passed);
    }

    /// Records when each user ran its first iteration, relative to `origin`.
    struct FirstSeen {
        origin: std::time::Instant,
        first: parking_lot::Mutex<Option<Duration>>,
    }

    #[async_trait]
    impl Workload for FirstSeen {
        async fn iteration(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            self.first.lock().get_or_insert_with(|| self.origin.elapsed());
            vu.counter(vu.scenario()).add(1.0);
            vu.sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_time_offsets_scenario() {
        let origin = std::time::Instant::now();
        let early = Arc::new(FirstSeen {
            origin,
            first: parking_lot::Mutex::new(None),
        });
        let late = Arc::new(FirstSeen {
            origin,
            first: parking_lot::Mutex::new(None),
        });
        let mut r = WorkloadRegistry::new();
        r.register("early", early.clone());
        r.register("late", late.clone());

        let mut p = plan("early", RampProfile::constant(1, Duration::from_millis(600)));
        p.scenarios = vec![
            scenario("first", "early", RampProfile::constant(1, Duration::from_millis(600)), Duration::ZERO),
            scenario(
                "second",
                "late",
                RampProfile::constant(2, Duration::from_millis(300)),
                Duration::from_millis(300),
            ),
        ];

        let result = Engine::new().run(&p, &r).await.unwrap();

        let early_at = early.first.lock().unwrap();
        let late_at = late.first.lock().unwrap();
        assert!(late_at >= early_at + Duration::from_millis(250), "{:?} vs {:?}", early_at, late_at);
        assert!(result.metrics.counters["first"] > 0.0);
        assert!(result.metrics.counters["second"] > 0.0);
        assert_eq!(result.metrics.gauges[VUS_MAX], 3.0);
        assert_eq!(result.phases.last().map(|(ph, _)| *ph), Some(RunPhase::Completed));
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_hard_stop_with_one_pool_drained() {
        let engine = Engine::new();
        let mut p = plan("busy", RampProfile::constant(1, Duration::from_millis(200)));
        p.scenarios.push(scenario(
            "hung",
            "stuck",
            RampProfile::constant(1, Duration::from_millis(200)),
            Duration::ZERO,
        ));
        p.graceful_stop = Duration::from_millis(300);

        let result = engine.run(&p, &registry()).await.unwrap();
        assert!(result.metrics.counters["work"] > 0.0);
        assert!(result.elapsed_secs < 5.0);
        assert_eq!(engine.control().phase(), RunPhase::Completed);
    }

    #[tokio::test]
    async fn test_engine_can_run_twice() {
        let engine = Engine::new();
        let p = plan("busy", RampProfile::constant(1, Duration::from_millis(200)));
        let first = engine.run(&p, &registry()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = engine.run(&p, &registry()).await.unwrap();

        assert!(first.passed && second.passed);
        assert_eq!(second.stop_reason, None);
        assert!(second.metrics.iterations > 0);
        assert_eq!(second.phases[0], (RunPhase::Configuring, 0.0));
        // offsets restart with the run, the idle gap before it is not counted
        let (last, at) = *second.phases.last().unwrap();
        assert_eq!(last, RunPhase::Completed);
        assert!(at >= 0.2);
        assert!(at < 0.9, "{}", at);
    }
}
