pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod utils;
pub mod workload;

pub use engine::{Engine, RunPlan, RunResult};
pub use error::ConfigError;
pub use utils::parse_duration_str;
pub use workload::{VuContext, Workload, WorkloadRegistry};
