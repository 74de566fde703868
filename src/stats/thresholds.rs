//! Pass/fail criteria over aggregated metrics.
//!
//! Expressions follow the k6 form `<aggregation> <operator> <number>[unit]`,
//! e.g. `p(95)<500`, `rate < 0.01`, `count==0`. Whitespace is optional.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use super::{builtin_kind, MetricKind, MetricView, StatsAggregator};
use crate::error::{ConfigError, ConfigResult};

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(avg|min|max|med|count|rate|value|p\(\s*\d+(?:\.\d+)?\s*\)|p\d+(?:\.\d+)?)\s*(<=|>=|==|!=|<|>)\s*(-?\d+(?:\.\d+)?)\s*(ms|s)?\s*$",
    )
    .unwrap_or_else(|e| unreachable!("threshold regex is valid: {e}"))
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in 0..=100.
    Percentile(f64),
    Count,
    Rate,
    Value,
}

impl Aggregation {
    fn parse(token: &str) -> Result<Self, String> {
        Ok(match token {
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            "count" => Aggregation::Count,
            "rate" => Aggregation::Rate,
            "value" => Aggregation::Value,
            p => {
                let digits = p
                    .trim_start_matches('p')
                    .trim_start_matches('(')
                    .trim_end_matches(')')
                    .trim();
                let pct: f64 = digits
                    .parse()
                    .map_err(|_| format!("invalid percentile '{}'", p))?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(format!("percentile {} out of range 0..100", pct));
                }
                Aggregation::Percentile(pct)
            }
        })
    }

    fn applies_to(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => !matches!(self, Aggregation::Rate | Aggregation::Value),
            MetricKind::Rate => matches!(self, Aggregation::Rate | Aggregation::Count),
            MetricKind::Counter => matches!(self, Aggregation::Count | Aggregation::Value),
            MetricKind::Gauge => matches!(
                self,
                Aggregation::Value | Aggregation::Min | Aggregation::Max
            ),
        }
    }

    /// Read this aggregation off a resolved metric. `None` when it does not
    /// apply to the metric's kind.
    fn observe(&self, view: MetricView<'_>) -> Option<f64> {
        if !self.applies_to(view.kind()) {
            return None;
        }
        Some(match view {
            MetricView::Counter(v) | MetricView::Gauge(v) => v,
            MetricView::Rate { total, success } => match self {
                Aggregation::Count => total as f64,
                _ if total == 0 => 0.0,
                _ => success as f64 / total as f64,
            },
            MetricView::Trend(t) => match self {
                Aggregation::Avg => t.avg(),
                Aggregation::Min => t.min(),
                Aggregation::Max => t.max(),
                Aggregation::Med => t.quantile(0.5),
                Aggregation::Percentile(p) => t.quantile(p / 100.0),
                _ => t.count() as f64,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            _ => return None,
        })
    }

    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        const EPS: f64 = 1e-9;
        match self {
            Operator::Lt => observed < limit,
            Operator::Le => observed <= limit,
            Operator::Gt => observed > limit,
            Operator::Ge => observed >= limit,
            Operator::Eq => (observed - limit).abs() < EPS,
            Operator::Ne => (observed - limit).abs() >= EPS,
        }
    }
}

/// One parsed criterion. `value` is normalised to milliseconds when the
/// expression carried a time unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expression: String,
    pub aggregation: Aggregation,
    pub operator: Operator,
    pub value: f64,
}

impl ThresholdSpec {
    pub fn parse(metric: &str, expression: &str) -> ConfigResult<Self> {
        let err = |reason: &str| ConfigError::threshold(metric, expression, reason);

        let caps = EXPRESSION
            .captures(expression)
            .ok_or_else(|| err("expected '<aggregation> <operator> <number>', e.g. 'p(95)<500'"))?;

        let aggregation = Aggregation::parse(&caps[1]).map_err(|reason| err(&reason))?;
        let operator = Operator::parse(&caps[2]).ok_or_else(|| err("unknown operator"))?;
        let mut value: f64 = caps[3].parse().map_err(|_| err("invalid number"))?;
        if caps.get(4).is_some_and(|unit| unit.as_str() == "s") {
            value *= 1000.0;
        }

        if let Some(kind) = builtin_kind(metric) {
            if !aggregation.applies_to(kind) {
                return Err(err(&format!(
                    "aggregation does not apply to {:?} metric",
                    kind
                )));
            }
        }

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.trim().to_string(),
            aggregation,
            operator,
            value,
        })
    }

    pub fn evaluate(&self, snapshot: &StatsAggregator) -> ThresholdOutcome {
        // Never-recorded metrics read as empty: count 0, rate 0, trend 0.
        let observed = match snapshot.metric(&self.metric) {
            Some(view) => self.aggregation.observe(view),
            None => Some(0.0),
        };
        let passed = observed.is_some_and(|v| self.operator.holds(v, self.value));
        ThresholdOutcome {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            observed,
            passed,
        }
    }
}

impl fmt::Display for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expression)
    }
}

/// Parse a `metric -> [expressions]` table. Metrics are visited in name order.
pub fn parse_criteria(criteria: &BTreeMap<String, Vec<String>>) -> ConfigResult<Vec<ThresholdSpec>> {
    let mut specs = Vec::new();
    for (metric, expressions) in criteria {
        for expression in expressions {
            specs.push(ThresholdSpec::parse(metric, expression)?);
        }
    }
    Ok(specs)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    /// `None` when the aggregation does not apply to the recorded metric type.
    pub observed: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub outcomes: Vec<ThresholdOutcome>,
}

impl Evaluation {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }

    /// A metric fails when any of its thresholds fails.
    pub fn verdicts(&self) -> BTreeMap<String, Verdict> {
        let mut verdicts = BTreeMap::new();
        for o in &self.outcomes {
            let entry = verdicts.entry(o.metric.clone()).or_insert(Verdict::Pass);
            if !o.passed {
                *entry = Verdict::Fail;
            }
        }
        verdicts
    }

    pub fn print(&self) {
        if self.outcomes.is_empty() {
            return;
        }
        println!("\nThresholds:");
        for o in &self.outcomes {
            let mark = if o.passed { "✓" } else { "✗" };
            match o.observed {
                Some(v) => println!("  {} {}: {} (observed {:.4})", mark, o.metric, o.expression, v),
                None => println!(
                    "  {} {}: {} (aggregation not applicable)",
                    mark, o.metric, o.expression
                ),
            }
        }
    }
}

pub fn evaluate(specs: &[ThresholdSpec], snapshot: &StatsAggregator) -> Evaluation {
    Evaluation {
        outcomes: specs.iter().map(|s| s.evaluate(snapshot)).collect(),
    }
}
