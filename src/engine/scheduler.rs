//! Ramp profiles: how many virtual users should be alive at a given instant.

use crate::error::{ConfigError, ConfigResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One segment of a ramp profile. The target is reached at the end of the
/// stage's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// How the target moves between two stage boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Straight line from the previous target to this stage's target.
    #[default]
    Linear,
    /// Jump to this stage's target as soon as the stage begins.
    Step,
}

/// Ordered, validated list of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampProfile {
    stages: Vec<Stage>,
    start_target: usize,
    interpolation: Interpolation,
}

impl RampProfile {
    /// Build a profile; an empty stage list is rejected. `name` only feeds the error.
    pub fn new(
        name: &str,
        stages: Vec<Stage>,
        start_target: usize,
        interpolation: Interpolation,
    ) -> ConfigResult<Self> {
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule(name.to_string()));
        }
        Ok(Self {
            stages,
            start_target,
            interpolation,
        })
    }

    /// `workers` users for `duration`, reached immediately.
    pub fn constant(workers: usize, duration: Duration) -> Self {
        Self {
            stages: vec![Stage::new(Duration::ZERO, workers), Stage::new(duration, workers)],
            start_target: 0,
            interpolation: Interpolation::Linear,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Highest target anywhere in the profile, used to size shards and the connection pool.
    pub fn peak(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_target))
            .max()
            .unwrap_or(0)
    }

    /// Index of the stage containing `elapsed`, with the target the stage starts from.
    /// `None` once the profile is over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<(usize, usize)> {
        let mut stage_start = Duration::ZERO;
        let mut prev_target = self.start_target;
        for (idx, stage) in self.stages.iter().enumerate() {
            if elapsed < stage_start + stage.duration {
                return Some((idx, prev_target));
            }
            stage_start += stage.duration;
            prev_target = stage.target;
        }
        None
    }

    /// Desired number of virtual users at `elapsed` since the profile started.
    pub fn concurrency_at(&self, elapsed: Duration) -> usize {
        let mut stage_start = Duration::ZERO;
        let mut prev_target = self.start_target;
        for stage in &self.stages {
            if elapsed < stage_start + stage.duration {
                return match self.interpolation {
                    Interpolation::Step => stage.target,
                    Interpolation::Linear => {
                        let progress = (elapsed - stage_start).as_secs_f64()
                            / stage.duration.as_secs_f64();
                        let diff = stage.target as f64 - prev_target as f64;
                        (prev_target as f64 + diff * progress).round().max(0.0) as usize
                    }
                };
            }
            stage_start += stage.duration;
            prev_target = stage.target;
        }
        prev_target
    }
}
