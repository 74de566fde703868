//! Declarative workloads: an ordered list of HTTP steps with checks, captured
//! variables and failure counters, loaded from YAML or JSON.
//!
//! ```yaml
//! flows:
//!   purchase:
//!     think_time: 1s
//!     vars:
//!       email: "loadtest_{{vu}}_{{iter}}_{{timestamp}}@test.com"
//!     on_success: [system_workflow_passed]
//!     on_failure: [system_workflow_failed]
//!     steps:
//!       - name: login
//!         method: POST
//!         path: /users/login
//!         body: { email: "{{email}}", password: "secret" }
//!         checks: { status: [200] }
//!         capture: { token: "access_token|token" }
//!         on_failure: { counters: [integration_errors], abort: true }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{VuContext, Workload};
use crate::engine::http_client::{HttpResponse, RequestSpec};
use crate::error::{ConfigError, ConfigResult};
use crate::utils::{as_millis_f64, parse_duration_str};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
        .unwrap_or_else(|e| unreachable!("placeholder regex is valid: {e}"))
});

/// Variables every iteration starts with.
const BUILTIN_VARS: [&str; 5] = ["vu", "iter", "timestamp", "scenario", "path"];

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    pub steps: Vec<StepConfig>,
    /// Pause after every step unless the step sets its own.
    #[serde(default, alias = "thinkTime")]
    pub think_time: Option<String>,
    /// Variables rendered once at the start of each iteration. They may only
    /// reference built-ins (`vu`, `iter`, `timestamp`, `scenario`).
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Counters bumped by one when every step passed.
    #[serde(default, alias = "onSuccess")]
    pub on_success: Vec<String>,
    /// Counters bumped by one when any step failed.
    #[serde(default, alias = "onFailure")]
    pub on_failure: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Used to name checks and as the per-endpoint stats tag. May use `{{path}}`.
    pub name: String,
    #[serde(default)]
    pub method: Option<String>,
    pub path: Option<String>,
    /// Rotating path list; each virtual user picks `paths[vu % len]`.
    #[serde(default, alias = "rotate")]
    pub paths: Option<Vec<String>>,
    /// JSON body. Strings are templated; a string that is exactly one
    /// placeholder keeps the variable's JSON type.
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Bearer token template, sent as `Authorization: Bearer <token>`.
    pub auth: Option<String>,
    pub timeout: Option<String>,
    #[serde(default)]
    pub checks: CheckConfig,
    /// variable -> JSON path. Alternatives separated by `|`, first match wins.
    #[serde(default)]
    pub capture: BTreeMap<String, String>,
    /// Statuses that never fail the step. Checks are still recorded, so they
    /// still count against the `checks` rate.
    #[serde(default, alias = "tolerateStatus")]
    pub tolerate_status: Vec<u16>,
    #[serde(default, alias = "onFailure")]
    pub on_failure: FailureConfig,
    #[serde(default, alias = "thinkTime")]
    pub think_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    /// Accepted status codes.
    pub status: Option<Vec<u16>>,
    #[serde(alias = "maxDuration")]
    pub max_duration: Option<String>,
    #[serde(alias = "bodyContains")]
    pub body_contains: Option<String>,
    #[serde(default, alias = "jsonExists")]
    pub json_exists: Vec<String>,
    #[serde(default, alias = "jsonEquals")]
    pub json_equals: BTreeMap<String, Value>,
    #[serde(default, alias = "jsonNonEmptyArray")]
    pub json_non_empty_array: Vec<String>,
    #[serde(default, alias = "jsonIsArray")]
    pub json_is_array: Vec<String>,
    /// path -> minimum numeric value.
    #[serde(default, alias = "jsonMin")]
    pub json_min: BTreeMap<String, f64>,
    #[serde(alias = "jsonContainsItem")]
    pub json_contains_item: Option<ContainsItemConfig>,
}

/// Passes when some element of the array at `path` has every field in `fields`.
/// With `min`, a second check requires the first such element to have each
/// listed field at or above the given value.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ContainsItemConfig {
    pub path: String,
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub min: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FailureConfig {
    #[serde(default)]
    pub counters: Vec<String>,
    /// Skip the remaining steps of this iteration.
    #[serde(default)]
    pub abort: bool,
}

#[derive(Debug, Clone)]
enum Check {
    Status(Vec<u16>),
    MaxDuration(Duration),
    BodyContains(String),
    JsonExists(String),
    JsonEquals(String, Value),
    JsonNonEmptyArray(String),
    JsonIsArray(String),
    JsonMin(String, f64),
    JsonContainsItem(String, BTreeMap<String, Value>),
    JsonItemMin(String, BTreeMap<String, Value>, BTreeMap<String, f64>),
}

impl Check {
    fn label(&self, step: &str) -> String {
        match self {
            Check::Status(codes) => {
                let codes: Vec<String> = codes.iter().map(u16::to_string).collect();
                format!("{} returns {}", step, codes.join("|"))
            }
            Check::MaxDuration(d) => format!("{} response time < {}ms", step, d.as_millis()),
            Check::BodyContains(s) => format!("{} body contains {}", step, s),
            Check::JsonExists(p) => format!("{} has {}", step, p),
            Check::JsonEquals(p, _) => format!("{} {} matches", step, p),
            Check::JsonNonEmptyArray(p) => format!("{} {} is a non-empty array", step, p),
            Check::JsonIsArray(p) => format!("{} {} is an array", step, p),
            Check::JsonMin(p, min) => format!("{} {} >= {}", step, p, min),
            Check::JsonContainsItem(p, _) => format!("{} {} contains item", step, p),
            Check::JsonItemMin(p, _, min) => {
                let bounds: Vec<String> = min.iter().map(|(f, m)| format!("{} >= {}", f, m)).collect();
                format!("{} {} item {}", step, p, bounds.join(", "))
            }
        }
    }

    fn evaluate(&self, resp: &HttpResponse, json: Option<&Value>, vars: &Vars) -> anyhow::Result<bool> {
        let at = |path: &str| json.and_then(|j| lookup(j, path));
        Ok(match self {
            Check::Status(codes) => resp.status().is_some_and(|s| codes.contains(&s)),
            Check::MaxDuration(max) => resp.sample.error.is_none() && resp.duration() < *max,
            Check::BodyContains(s) => resp.text().contains(&vars.render(s)?),
            Check::JsonExists(p) => at(p).is_some_and(|v| !v.is_null()),
            Check::JsonEquals(p, expected) => {
                let expected = vars.render_value(expected)?;
                at(p).is_some_and(|v| loosely_equal(v, &expected))
            }
            Check::JsonNonEmptyArray(p) => {
                at(p).and_then(Value::as_array).is_some_and(|a| !a.is_empty())
            }
            Check::JsonIsArray(p) => at(p).is_some_and(Value::is_array),
            Check::JsonMin(p, min) => at(p).and_then(Value::as_f64).is_some_and(|v| v >= *min),
            Check::JsonContainsItem(p, fields) => find_item(at(p), fields, vars)?.is_some(),
            Check::JsonItemMin(p, fields, min) => find_item(at(p), fields, vars)?.is_some_and(|item| {
                min.iter().all(|(field, bound)| {
                    lookup(item, field)
                        .and_then(Value::as_f64)
                        .is_some_and(|v| v >= *bound)
                })
            }),
        })
    }

    fn templates(&self) -> Vec<&str> {
        match self {
            Check::BodyContains(s) => vec![s.as_str()],
            Check::JsonEquals(_, v) => value_templates(v),
            Check::JsonContainsItem(_, fields) | Check::JsonItemMin(_, fields, _) => {
                fields.values().flat_map(value_templates).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Step {
    name: String,
    method: Method,
    paths: Vec<String>,
    body: Option<Value>,
    headers: Vec<(HeaderName, String)>,
    auth: Option<String>,
    timeout: Option<Duration>,
    checks: Vec<Check>,
    captures: Vec<(String, Vec<String>)>,
    tolerate_status: Vec<u16>,
    failure_counters: Vec<String>,
    abort_on_failure: bool,
    think_time: Option<Duration>,
}

/// A flow compiled and validated from its [`FlowConfig`].
#[derive(Debug, Clone)]
pub struct FlowWorkload {
    name: String,
    steps: Vec<Step>,
    vars: Vec<(String, String)>,
    on_success: Vec<String>,
    on_failure: Vec<String>,
}

impl FlowWorkload {
    pub fn from_config(name: &str, config: &FlowConfig) -> ConfigResult<Self> {
        let err = |reason: String| ConfigError::Flow {
            flow: name.to_string(),
            reason,
        };
        let duration = |field: String, value: &Option<String>| -> ConfigResult<Option<Duration>> {
            value
                .as_deref()
                .map(|v| parse_duration_str(v).ok_or_else(|| ConfigError::duration(field, v)))
                .transpose()
        };

        if config.steps.is_empty() {
            return Err(err("a flow needs at least one step".to_string()));
        }

        let flow_think = duration(format!("flows.{}.think_time", name), &config.think_time)?;

        let mut known: HashSet<String> = BUILTIN_VARS.iter().map(|s| s.to_string()).collect();
        let mut vars = Vec::new();
        for (var, template) in &config.vars {
            for used in placeholders(template) {
                if !BUILTIN_VARS.contains(&used) || used == "path" {
                    return Err(err(format!(
                        "var '{}' may only use built-in variables, found '{{{{{}}}}}'",
                        var, used
                    )));
                }
            }
            vars.push((var.clone(), template.clone()));
        }
        known.extend(config.vars.keys().cloned());

        let mut steps = Vec::with_capacity(config.steps.len());
        for (idx, sc) in config.steps.iter().enumerate() {
            let field = |f: &str| format!("flows.{}.steps[{}].{}", name, idx, f);

            let method = match sc.method.as_deref() {
                None => Method::GET,
                Some(m) => Method::from_str(&m.to_ascii_uppercase())
                    .map_err(|_| err(format!("step '{}': invalid method '{}'", sc.name, m)))?,
            };

            let paths = match (&sc.path, &sc.paths) {
                (Some(p), None) => vec![p.clone()],
                (None, Some(ps)) if !ps.is_empty() => ps.clone(),
                (Some(_), Some(_)) => {
                    return Err(err(format!(
                        "step '{}': set either path or paths, not both",
                        sc.name
                    )))
                }
                _ => return Err(err(format!("step '{}': missing path", sc.name))),
            };

            let mut headers = Vec::with_capacity(sc.headers.len());
            for (k, v) in &sc.headers {
                let header = HeaderName::from_str(k).map_err(|_| ConfigError::Header(k.clone()))?;
                headers.push((header, v.clone()));
            }

            let mut checks = Vec::new();
            let c = &sc.checks;
            if let Some(codes) = &c.status {
                checks.push(Check::Status(codes.clone()));
            }
            if let Some(max) = duration(field("checks.max_duration"), &c.max_duration)? {
                checks.push(Check::MaxDuration(max));
            }
            if let Some(s) = &c.body_contains {
                checks.push(Check::BodyContains(s.clone()));
            }
            checks.extend(c.json_exists.iter().cloned().map(Check::JsonExists));
            checks.extend(
                c.json_equals
                    .iter()
                    .map(|(p, v)| Check::JsonEquals(p.clone(), v.clone())),
            );
            checks.extend(c.json_non_empty_array.iter().cloned().map(Check::JsonNonEmptyArray));
            checks.extend(c.json_is_array.iter().cloned().map(Check::JsonIsArray));
            checks.extend(c.json_min.iter().map(|(p, min)| Check::JsonMin(p.clone(), *min)));
            if let Some(item) = &c.json_contains_item {
                checks.push(Check::JsonContainsItem(item.path.clone(), item.fields.clone()));
                if !item.min.is_empty() {
                    checks.push(Check::JsonItemMin(
                        item.path.clone(),
                        item.fields.clone(),
                        item.min.clone(),
                    ));
                }
            }

            let step = Step {
                name: sc.name.clone(),
                method,
                paths,
                body: sc.body.clone(),
                headers,
                auth: sc.auth.clone(),
                timeout: duration(field("timeout"), &sc.timeout)?,
                checks,
                captures: sc
                    .capture
                    .iter()
                    .map(|(var, path)| {
                        (var.clone(), path.split('|').map(|p| p.trim().to_string()).collect())
                    })
                    .collect(),
                tolerate_status: sc.tolerate_status.clone(),
                failure_counters: sc.on_failure.counters.clone(),
                abort_on_failure: sc.on_failure.abort,
                think_time: duration(field("think_time"), &sc.think_time)?.or(flow_think),
            };

            // `path` is the rendered path, so the path itself cannot use it.
            if let Some(p) = step.paths.iter().find(|p| placeholders(p).any(|v| v == "path")) {
                return Err(err(format!(
                    "step '{}': path '{}' cannot use '{{{{path}}}}'",
                    step.name, p
                )));
            }

            // Everything this step renders must be known before it runs.
            for used in step.templates() {
                if !known.contains(used) {
                    return Err(err(format!(
                        "step '{}' uses '{{{{{}}}}}' before it is captured",
                        step.name, used
                    )));
                }
            }
            known.extend(step.captures.iter().map(|(var, _)| var.clone()));
            steps.push(step);
        }

        Ok(Self {
            name: name.to_string(),
            steps,
            vars,
            on_success: config.on_success.clone(),
            on_failure: config.on_failure.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Run one step. `Ok(false)` means a check or capture failed.
    async fn run_step(&self, step: &Step, vu: &VuContext, vars: &mut Vars) -> anyhow::Result<bool> {
        let path = &step.paths[(vu.vu_id() as usize) % step.paths.len()];
        let path = vars.render(path)?;
        vars.set("path", Value::String(path.clone()));
        let name = vars.render(&step.name)?;

        let mut spec = RequestSpec::new(step.method.clone(), vu.url(&path)).tag(name.clone());
        if let Some(body) = &step.body {
            spec = spec
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(vars.render_value(body)?.to_string());
        }
        for (header, template) in &step.headers {
            spec = spec.header(header.clone(), HeaderValue::from_str(&vars.render(template)?)?);
        }
        if let Some(token) = &step.auth {
            let value = format!("Bearer {}", vars.render(token)?);
            spec = spec.header(AUTHORIZATION, HeaderValue::from_str(&value)?);
        }
        if let Some(timeout) = step.timeout {
            spec = spec.timeout(timeout);
        }

        let resp = vu.request(spec).await;
        let tolerated = resp.status().is_some_and(|s| step.tolerate_status.contains(&s));

        let json = resp.json();
        let mut passed = true;
        for check in &step.checks {
            let ok = check.evaluate(&resp, json.as_ref(), vars)?;
            passed &= vu.check(&check.label(&name), ok);
        }

        for (var, alternatives) in &step.captures {
            let found = json
                .as_ref()
                .and_then(|j| alternatives.iter().find_map(|p| lookup(j, p)))
                .filter(|v| !v.is_null())
                .cloned();
            match found {
                Some(value) => vars.set(var, value),
                None => {
                    debug!(step = %name, var = %var, "Capture failed");
                    passed = false;
                }
            }
        }

        if tolerated {
            debug!(step = %name, status = ?resp.status(), passed, "Tolerated status");
            return Ok(true);
        }
        if !passed {
            debug!(
                step = %name,
                status = ?resp.status(),
                duration_ms = as_millis_f64(resp.duration()),
                "Step failed"
            );
        }
        Ok(passed)
    }
}

impl Step {
    fn templates(&self) -> Vec<&str> {
        let mut strings: Vec<&str> = vec![self.name.as_str()];
        strings.extend(self.paths.iter().map(String::as_str));
        strings.extend(self.headers.iter().map(|(_, v)| v.as_str()));
        strings.extend(self.auth.as_deref());
        if let Some(body) = &self.body {
            strings.extend(value_templates(body));
        }
        for check in &self.checks {
            strings.extend(check.templates());
        }
        strings.into_iter().flat_map(placeholders).collect()
    }
}

#[async_trait]
impl Workload for FlowWorkload {
    async fn iteration(&self, vu: &mut VuContext) -> anyhow::Result<()> {
        let mut vars = Vars::for_iteration(vu);
        for (var, template) in &self.vars {
            let value = vars.render(template)?;
            vars.set(var, Value::String(value));
        }

        let mut flow_ok = true;
        for step in &self.steps {
            let passed = match self.run_step(step, vu, &mut vars).await {
                Ok(passed) => passed,
                Err(e) => {
                    self.bump(vu, &step.failure_counters);
                    self.bump(vu, &self.on_failure);
                    return Err(e.context(format!("flow '{}' step '{}'", self.name, step.name)));
                }
            };

            if !passed {
                flow_ok = false;
                self.bump(vu, &step.failure_counters);
                if step.abort_on_failure {
                    break;
                }
            }

            if let Some(think) = step.think_time {
                vu.sleep(think).await;
            }
        }

        if flow_ok {
            self.bump(vu, &self.on_success);
        } else {
            self.bump(vu, &self.on_failure);
        }
        Ok(())
    }
}

impl FlowWorkload {
    fn bump(&self, vu: &VuContext, counters: &[String]) {
        for name in counters {
            vu.counter(name).add(1.0);
        }
    }
}

/// Per-iteration variable table.
struct Vars {
    values: HashMap<String, Value>,
}

impl Vars {
    fn for_iteration(vu: &VuContext) -> Self {
        let mut values = HashMap::new();
        values.insert("vu".to_string(), Value::from(vu.vu_id()));
        values.insert("iter".to_string(), Value::from(vu.iteration()));
        values.insert("timestamp".to_string(), Value::from(Utc::now().timestamp_millis()));
        values.insert("scenario".to_string(), Value::from(vu.scenario()));
        Self { values }
    }

    fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    fn get(&self, name: &str) -> anyhow::Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("variable '{}' is not set", name))
    }

    fn render(&self, template: &str) -> anyhow::Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(var)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            match self.get(var.as_str())? {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    fn render_value(&self, value: &Value) -> anyhow::Result<Value> {
        Ok(match value {
            Value::String(s) => match whole_placeholder(s) {
                Some(var) => self.get(var)?.clone(),
                None => Value::String(self.render(s)?),
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v))
                    .collect::<anyhow::Result<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }
}

fn placeholders(template: &str) -> impl Iterator<Item = &str> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}

/// First element of the array `items` whose `fields` all match.
fn find_item<'a>(
    items: Option<&'a Value>,
    fields: &BTreeMap<String, Value>,
    vars: &Vars,
) -> anyhow::Result<Option<&'a Value>> {
    let mut wanted = Vec::with_capacity(fields.len());
    for (field, value) in fields {
        wanted.push((field.as_str(), vars.render_value(value)?));
    }
    Ok(items.and_then(Value::as_array).and_then(|items| {
        items.iter().find(|item| {
            wanted
                .iter()
                .all(|(field, expected)| lookup(item, field).is_some_and(|v| loosely_equal(v, expected)))
        })
    }))
}

/// `"{{x}}"` -> `Some("x")`; anything else -> `None`.
fn whole_placeholder(s: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

fn value_templates(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().flat_map(value_templates).collect(),
        Value::Object(map) => map.values().flat_map(value_templates).collect(),
        _ => Vec::new(),
    }
}

/// Dotted path lookup (`data.0.id`); `$` or the empty string is the root.
pub fn lookup<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == "$" {
        return Some(json);
    }
    let pointer: String = path
        .split('.')
        .map(|seg| format!("/{}", seg.replace('~', "~0").replace('/', "~1")))
        .collect();
    json.pointer(&pointer)
}

/// Equality that tolerates numbers sent back as strings and 1 vs 1.0.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), other @ (Value::Number(_) | Value::Bool(_)))
        | (other @ (Value::Number(_) | Value::Bool(_)), Value::String(s)) => *s == other.to_string(),
        _ => false,
    }
}
