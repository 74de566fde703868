use anyhow::Result;
use std::fs;
use std::path::Path;

const DEFAULT_FILE: &str = "barrage.yaml";

const DEFAULT_CONFIG: &str = r#"# Barrage load test
# Run with: barrage run barrage.yaml
# Validate: barrage validate barrage.yaml

base_url: http://localhost:8091
headers:
  Accept: application/json

workers: 10
duration: 30s

# Ramping schedule (optional, replaces workers/duration)
# stages:
#   - duration: 10s
#     target: 5
#   - duration: 20s
#     target: 10
#   - duration: 10s
#     target: 0

# Pass/fail criteria
thresholds:
  http_req_duration: ["p(95)<500"]
  http_req_failed: ["rate<0.01"]
  checks: ["rate>0.95"]

flows:
  smoke:
    think_time: 1s
    steps:
      - name: status
        path: /status
        checks:
          status: [200]
          max_duration: 1000ms
"#;

/// Write a starter test file.
pub fn run_init(output: Option<&Path>) -> Result<()> {
    let path = output.unwrap_or(Path::new(DEFAULT_FILE));

    if path.exists() {
        anyhow::bail!(
            "File already exists: {:?}. Remove it first or choose a different output path.",
            path
        );
    }

    // Create parent directories if needed
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::write(path, DEFAULT_CONFIG)?;
    println!("✓ Created {}", path.display());

    println!("\nRun your test with:");
    println!("  barrage run {}", path.display());

    Ok(())
}
