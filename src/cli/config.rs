use http::header::{HeaderMap, HeaderName, HeaderValue};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::http_client::DEFAULT_TIMEOUT;
use crate::engine::pool::IterationLimits;
use crate::engine::scheduler::{Interpolation, RampProfile, Stage};
use crate::engine::{RunPlan, ScenarioPlan, DEFAULT_GRACEFUL_STOP};
use crate::error::{ConfigError, ConfigResult};
use crate::stats::thresholds::parse_criteria;
use crate::utils::parse_duration_str;
use crate::workload::flow::{FlowConfig, FlowWorkload};
use crate::workload::WorkloadRegistry;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8091";
pub const DEFAULT_EXEC: &str = "default";
pub const DEFAULT_SCENARIO: &str = "default";
/// Upper bound for iteration-based scenarios without a duration.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ScheduleStep {
    pub duration: String,
    pub target: usize,
}

/// Configuration for a single scenario within multi-scenario tests
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct ScenarioConfig {
    /// Number of concurrent workers (k6: vus)
    #[serde(alias = "vus")]
    pub workers: Option<usize>,
    /// Duration of the scenario
    pub duration: Option<String>,
    /// Fixed iterations per worker
    pub iterations: Option<u64>,
    /// Ceiling for iteration-based scenarios (default: 10m)
    #[serde(alias = "maxDuration")]
    pub max_duration: Option<String>,
    /// Ramping schedule (k6: stages)
    #[serde(alias = "stages")]
    pub schedule: Option<Vec<ScheduleStep>>,
    /// Workers at the start of the schedule (k6: startVUs)
    #[serde(alias = "startVUs", alias = "start_vus")]
    pub start_workers: Option<usize>,
    pub interpolation: Option<Interpolation>,
    /// Workload to execute (default: the only flow, else "default")
    pub exec: Option<String>,
    /// Delay before starting this scenario (e.g., "30s")
    #[serde(alias = "startTime")]
    pub start_time: Option<String>,
    #[serde(alias = "minIterationDuration")]
    pub min_iteration_duration: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Base URL relative request paths are resolved against
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Headers sent with every request
    pub headers: Option<BTreeMap<String, String>>,
    /// Number of concurrent workers (VUs)
    #[serde(alias = "vus")]
    pub workers: Option<usize>,
    /// Duration of the test (e.g., "10s", "1m")
    pub duration: Option<String>,
    /// Ramping schedule (stages)
    #[serde(alias = "stages")]
    pub schedule: Option<Vec<ScheduleStep>>,
    /// Workers at the start of the schedule
    #[serde(alias = "startVUs", alias = "start_vus")]
    pub start_workers: Option<usize>,
    /// Interpolation between stages: linear (default) or step
    pub interpolation: Option<Interpolation>,
    /// Workload to execute
    pub exec: Option<String>,
    /// Pass/Fail criteria (thresholds)
    #[serde(alias = "thresholds")]
    pub criteria: Option<BTreeMap<String, Vec<String>>>,
    /// Stop the test as soon as any threshold is breached. Thresholds are
    /// re-evaluated every second while the test runs.
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
    /// Grace period before breaches may abort the run (e.g., "30s")
    #[serde(alias = "delayAbortEval")]
    pub delay_abort_eval: Option<String>,
    /// Minimum time per iteration
    #[serde(alias = "minIterationDuration")]
    pub min_iteration_duration: Option<String>,
    /// Graceful shutdown wait time (default: 30s)
    #[serde(alias = "gracefulStop", alias = "graceful_stop")]
    pub stop: Option<String>,
    /// Per-request timeout (default: 60s)
    pub timeout: Option<String>,
    /// Fixed number of iterations per worker
    pub iterations: Option<u64>,
    /// Multiple scenarios with independent configs
    pub scenarios: Option<BTreeMap<String, ScenarioConfig>>,
    /// Declarative workloads, referenced by name from `exec`
    pub flows: Option<BTreeMap<String, FlowConfig>>,
}

fn duration_field(field: &str, value: Option<&String>) -> ConfigResult<Option<Duration>> {
    value
        .map(|v| parse_duration_str(v).ok_or_else(|| ConfigError::duration(field, v.as_str())))
        .transpose()
}

impl Config {
    /// Load a YAML or JSON config file; `.json` selects JSON, anything else YAML.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        Self::parse(&content, is_json)
    }

    pub fn parse(content: &str, is_json: bool) -> ConfigResult<Self> {
        if is_json {
            Ok(serde_json::from_str(content)?)
        } else {
            Ok(serde_yaml::from_str(content)?)
        }
    }

    /// Command-line overrides. Setting workers or duration replaces any
    /// schedule in the file.
    pub fn apply_overrides(
        &mut self,
        workers: Option<usize>,
        duration: Option<String>,
        base_url: Option<String>,
    ) {
        if workers.is_some() || duration.is_some() {
            self.schedule = None;
            self.scenarios = None;
        }
        if workers.is_some() {
            self.workers = workers;
        }
        if duration.is_some() {
            self.duration = duration;
        }
        if base_url.is_some() {
            self.base_url = base_url;
        }
    }

    fn default_exec(&self) -> String {
        match &self.flows {
            Some(flows) if flows.len() == 1 => flows
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| DEFAULT_EXEC.to_string()),
            _ => DEFAULT_EXEC.to_string(),
        }
    }

    /// Validate everything and produce a plan the engine can run.
    pub fn to_plan(&self) -> ConfigResult<RunPlan> {
        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        url::Url::parse(&base_url)?;

        let mut headers = HeaderMap::new();
        for (k, v) in self.headers.iter().flatten() {
            let name = HeaderName::from_str(k).map_err(|_| ConfigError::Header(k.clone()))?;
            let value = HeaderValue::from_str(v).map_err(|_| ConfigError::Header(k.clone()))?;
            headers.insert(name, value);
        }

        let top_level_load =
            self.workers.is_some() || self.duration.is_some() || self.schedule.is_some();
        let scenarios = match &self.scenarios {
            Some(_) if top_level_load => {
                return Err(ConfigError::Invalid(
                    "set either scenarios or top-level workers/duration/schedule, not both"
                        .to_string(),
                ))
            }
            Some(map) if map.is_empty() => {
                return Err(ConfigError::Invalid("scenarios is empty".to_string()))
            }
            Some(map) => map
                .iter()
                .map(|(name, sc)| self.scenario_plan(name, sc))
                .collect::<ConfigResult<Vec<_>>>()?,
            None => {
                let sc = ScenarioConfig {
                    workers: self.workers,
                    duration: self.duration.clone(),
                    iterations: self.iterations,
                    schedule: self.schedule.clone(),
                    start_workers: self.start_workers,
                    interpolation: self.interpolation,
                    exec: self.exec.clone(),
                    ..Default::default()
                };
                vec![self.scenario_plan(DEFAULT_SCENARIO, &sc)?]
            }
        };

        Ok(RunPlan {
            base_url,
            headers,
            scenarios,
            thresholds: parse_criteria(&self.criteria.clone().unwrap_or_default())?,
            abort_on_fail: self.abort_on_fail.unwrap_or(false),
            delay_abort_eval: duration_field("delay_abort_eval", self.delay_abort_eval.as_ref())?
                .unwrap_or(Duration::ZERO),
            graceful_stop: duration_field("stop", self.stop.as_ref())?
                .unwrap_or(DEFAULT_GRACEFUL_STOP),
            request_timeout: duration_field("timeout", self.timeout.as_ref())?
                .unwrap_or(DEFAULT_TIMEOUT),
        })
    }

    fn scenario_plan(&self, name: &str, sc: &ScenarioConfig) -> ConfigResult<ScenarioPlan> {
        let field = |f: &str| {
            if name == DEFAULT_SCENARIO && self.scenarios.is_none() {
                f.to_string()
            } else {
                format!("scenarios.{}.{}", name, f)
            }
        };

        let duration = duration_field(&field("duration"), sc.duration.as_ref())?;
        let max_duration = duration_field(&field("max_duration"), sc.max_duration.as_ref())?;
        if sc.workers == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than 0",
                field("workers")
            )));
        }
        let workers = sc.workers.unwrap_or(1);

        let profile = if let Some(schedule) = &sc.schedule {
            let mut stages = Vec::with_capacity(schedule.len());
            for (i, step) in schedule.iter().enumerate() {
                let d = parse_duration_str(&step.duration).ok_or_else(|| {
                    ConfigError::duration(field(&format!("schedule[{}].duration", i)), step.duration.as_str())
                })?;
                stages.push(Stage::new(d, step.target));
            }
            RampProfile::new(
                name,
                stages,
                sc.start_workers.unwrap_or(0),
                sc.interpolation.unwrap_or_default(),
            )?
        } else if let Some(d) = duration {
            RampProfile::constant(workers, d)
        } else if sc.iterations.is_some() {
            RampProfile::constant(workers, max_duration.unwrap_or(DEFAULT_MAX_DURATION))
        } else {
            return Err(ConfigError::Invalid(format!(
                "scenario '{}' has no load profile: set workers and duration, a schedule, or iterations",
                name
            )));
        };

        let min_iteration_duration = match &sc.min_iteration_duration {
            Some(v) => duration_field(&field("min_iteration_duration"), Some(v))?,
            None => duration_field("min_iteration_duration", self.min_iteration_duration.as_ref())?,
        };

        Ok(ScenarioPlan {
            name: name.to_string(),
            exec: sc.exec.clone().unwrap_or_else(|| self.default_exec()),
            profile,
            start_time: duration_field(&field("start_time"), sc.start_time.as_ref())?
                .unwrap_or(Duration::ZERO),
            limits: IterationLimits {
                max_iterations: sc.iterations,
                min_iteration_duration,
            },
        })
    }

    /// Compile every flow into a workload registered under its name.
    pub fn build_registry(&self) -> ConfigResult<WorkloadRegistry> {
        let mut registry = WorkloadRegistry::new();
        for (name, flow) in self.flows.iter().flatten() {
            registry.register(name.clone(), Arc::new(FlowWorkload::from_config(name, flow)?));
        }
        Ok(registry)
    }
}

/// Every scenario must point at a registered workload.
pub fn check_workloads(plan: &RunPlan, registry: &WorkloadRegistry) -> ConfigResult<()> {
    for scenario in &plan.scenarios {
        if !registry.contains(&scenario.exec) {
            return Err(ConfigError::UnknownWorkload {
                scenario: scenario.name.clone(),
                exec: scenario.exec.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::schema_for;

    const FLOW: &str = r#"
flows:
  browse:
    steps:
      - name: status
        path: /status
        checks: { status: [200] }
"#;

    fn yaml(s: &str) -> Config {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_config_schema() {
        let schema = schema_for!(Config);
        let schema_json = serde_json::to_string(&schema).unwrap();
        assert!(schema_json.contains("workers"));
        assert!(schema_json.contains("schedule"));
        assert!(schema_json.contains("criteria"));
        assert!(schema_json.contains("flows"));
    }

    #[test]
    fn test_config_deserialize_minimal() {
        let config = yaml("workers: 10\nduration: \"30s\"\n");
        assert_eq!(config.workers, Some(10));
        assert_eq!(config.duration, Some("30s".to_string()));

        let plan = config.to_plan().unwrap();
        assert_eq!(plan.base_url, DEFAULT_BASE_URL);
        assert_eq!(plan.scenarios.len(), 1);
        assert_eq!(plan.scenarios[0].exec, DEFAULT_EXEC);
        assert_eq!(plan.scenarios[0].profile.concurrency_at(Duration::ZERO), 10);
        assert_eq!(plan.total_duration(), Duration::from_secs(30));
        assert_eq!(plan.graceful_stop, DEFAULT_GRACEFUL_STOP);
        assert_eq!(plan.request_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_config_k6_aliases() {
        let config = yaml(
            r#"
baseUrl: "http://api.test:8080"
vus: 5
stages:
  - { duration: "10s", target: 10 }
  - { duration: "10s", target: 100 }
thresholds:
  http_req_duration: ["p(95)<500", "p(99)<1000"]
  http_req_failed: ["rate<0.01"]
abortOnFail: true
delayAbortEval: 5s
gracefulStop: 10s
"#,
        );
        let plan = config.to_plan().unwrap();
        assert_eq!(plan.base_url, "http://api.test:8080");
        assert_eq!(plan.scenarios[0].profile.concurrency_at(Duration::from_secs(15)), 55);
        assert_eq!(plan.thresholds.len(), 3);
        assert!(plan.abort_on_fail);
        assert_eq!(plan.delay_abort_eval, Duration::from_secs(5));
        assert_eq!(plan.graceful_stop, Duration::from_secs(10));
    }

    #[test]
    fn test_config_deserialize_json() {
        let json = r#"{"workers": 3, "duration": "1m", "headers": {"Accept": "application/json"}}"#;
        let config = Config::parse(json, true).unwrap();
        let plan = config.to_plan().unwrap();
        assert_eq!(plan.headers["accept"], "application/json");
        assert_eq!(plan.total_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_single_flow_is_default_exec() {
        let config = yaml(&format!("workers: 1\nduration: 1s\n{}", FLOW));
        let plan = config.to_plan().unwrap();
        assert_eq!(plan.scenarios[0].exec, "browse");
        let registry = config.build_registry().unwrap();
        check_workloads(&plan, &registry).unwrap();
    }

    #[test]
    fn test_multi_scenario() {
        let config = yaml(&format!(
            r#"
min_iteration_duration: 1s
scenarios:
  smoke:
    workers: 2
    duration: 30s
    exec: browse
  soak:
    stages: [{{ duration: 1m, target: 20 }}]
    startTime: 30s
    exec: browse
    minIterationDuration: 2s
  once:
    vus: 3
    iterations: 5
    exec: browse
{}"#,
            FLOW
        ));
        let plan = config.to_plan().unwrap();
        let names: Vec<&str> = plan.scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["once", "smoke", "soak"]);
        assert_eq!(plan.scenarios[0].limits.max_iterations, Some(5));
        assert_eq!(plan.scenarios[0].profile.total_duration(), DEFAULT_MAX_DURATION);
        assert_eq!(
            plan.scenarios[1].limits.min_iteration_duration,
            Some(Duration::from_secs(1))
        );
        assert_eq!(plan.scenarios[2].start_time, Duration::from_secs(30));
        assert_eq!(
            plan.scenarios[2].limits.min_iteration_duration,
            Some(Duration::from_secs(2))
        );
        assert_eq!(plan.total_duration(), DEFAULT_MAX_DURATION);
        assert_eq!(plan.peak_workers(), 25);
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            "workers: 1",
            "workers: 0\nduration: 1s",
            "duration: soon",
            "schedule: []",
            "schedule: [{duration: -5s, target: 1}]",
            "base_url: 'not a url'\nduration: 1s",
            "duration: 1s\nheaders: {'bad header': x}",
            "duration: 1s\ncriteria: {http_req_duration: ['p95 is fast']}",
            "duration: 1s\nstop: forever",
            "duration: 1s\nscenarios: {a: {duration: 1s}}",
            "scenarios: {}",
        ];
        for case in cases {
            assert!(yaml(case).to_plan().is_err(), "'{}' should be rejected", case);
        }
    }

    #[test]
    fn test_error_kinds() {
        assert!(matches!(
            yaml("schedule: []").to_plan(),
            Err(ConfigError::EmptySchedule(_))
        ));
        assert!(matches!(
            yaml("duration: soon").to_plan(),
            Err(ConfigError::Duration { field, .. }) if field == "duration"
        ));
        assert!(matches!(
            yaml("duration: 1s\ncriteria: {checks: ['rate>>1']}").to_plan(),
            Err(ConfigError::Threshold { .. })
        ));
    }

    #[test]
    fn test_unknown_exec_detected() {
        let config = yaml(&format!("workers: 1\nduration: 1s\nexec: checkout\n{}", FLOW));
        let plan = config.to_plan().unwrap();
        let registry = config.build_registry().unwrap();
        assert!(matches!(
            check_workloads(&plan, &registry),
            Err(ConfigError::UnknownWorkload { exec, .. }) if exec == "checkout"
        ));
    }

    #[test]
    fn test_overrides_replace_schedule() {
        let mut config = yaml("stages: [{duration: 1m, target: 50}]\n");
        config.apply_overrides(Some(4), Some("5s".to_string()), Some("http://x".to_string()));
        let plan = config.to_plan().unwrap();
        assert_eq!(plan.base_url, "http://x");
        assert_eq!(plan.total_duration(), Duration::from_secs(5));
        assert_eq!(plan.peak_workers(), 4);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.json");
        std::fs::write(&path, r#"{"workers": 2, "duration": "2s"}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.workers, Some(2));

        assert!(matches!(
            Config::load(&dir.path().join("missing.yaml")),
            Err(ConfigError::FileRead(_))
        ));
    }

    #[test]
    fn test_bundled_scenarios_are_valid() {
        let files = [
            include_str!("../../scenarios/load.yaml"),
            include_str!("../../scenarios/spike.yaml"),
            include_str!("../../scenarios/stress.yaml"),
            include_str!("../../scenarios/system.yaml"),
        ];
        for content in files {
            let config = Config::parse(content, false).unwrap();
            let plan = config.to_plan().unwrap();
            let registry = config.build_registry().unwrap();
            check_workloads(&plan, &registry).unwrap();
            assert!(!plan.thresholds.is_empty());
        }
    }
}
