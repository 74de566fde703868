use anyhow::Result;
use std::path::Path;

use crate::cli::config::{check_workloads, Config};

/// Validate a test file without running it.
/// Checks for:
/// - YAML/JSON syntax
/// - Load profiles, durations and headers
/// - Threshold expressions
/// - Flows and the workloads scenarios reference
pub fn run_validate(path: &Path) -> Result<()> {
    println!("Validating {}...", path.display());

    let config = match Config::load(path) {
        Ok(c) => c,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    };
    println!("  ✓ File parsed");

    let plan = match config.to_plan() {
        Ok(p) => p,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    };
    println!("  ✓ Configuration valid");
    println!("    base_url: {}", plan.base_url);
    for scenario in &plan.scenarios {
        println!(
            "    scenario '{}': exec={}, {} stage(s), peak {} workers, {:?}",
            scenario.name,
            scenario.exec,
            scenario.profile.stages().len(),
            scenario.profile.peak(),
            scenario.profile.total_duration()
        );
    }
    if !plan.thresholds.is_empty() {
        println!("  ✓ {} threshold(s) parsed", plan.thresholds.len());
    }

    let registry = match config.build_registry() {
        Ok(r) => r,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    };
    if let Err(e) = check_workloads(&plan, &registry) {
        println!("  ✗ {}", e);
        let mut known: Vec<&str> = registry.names().collect();
        known.sort_unstable();
        println!("    available: {:?}", known);
        return Err(e.into());
    }
    println!("  ✓ Workloads resolved");

    Ok(())
}
