use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use barrage::cli::config::{check_workloads, Config};
use barrage::engine::control::StopReason;
use barrage::engine::Engine;

/// Exit code when a threshold failed, distinct from usage/config errors.
const THRESHOLD_FAILED_EXIT: i32 = 99;

#[derive(Parser)]
#[command(name = "barrage")]
#[command(version, about = "HTTP load generator with ramping workers and pass/fail thresholds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test
    Run {
        /// Path to the test file (YAML/JSON)
        config: PathBuf,

        /// Number of concurrent workers (replaces the file's schedule)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Test duration, e.g. 30s, 5m (replaces the file's schedule)
        #[arg(short, long)]
        duration: Option<String>,

        /// Base URL of the system under test
        #[arg(long)]
        base_url: Option<String>,

        /// Print the final result as JSON instead of the text summary
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Export final result to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,

        /// Export final summary to a CSV file
        #[arg(long)]
        export_csv: Option<PathBuf>,

        /// Debug logging (overridden by RUST_LOG)
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
    /// Validate a test file without running it
    Validate {
        /// Path to the test file
        config: PathBuf,
    },
    /// Write a starter test file
    Init {
        /// Output path (defaults to barrage.yaml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the JSON schema of the test file format
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "barrage=debug" } else { "barrage=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workers,
            duration,
            base_url,
            json,
            export_json,
            export_csv,
            verbose,
        } => {
            init_tracing(verbose);

            let mut file_config = Config::load(&config)?;
            file_config.apply_overrides(workers, duration, base_url);
            let plan = file_config.to_plan()?;
            let registry = file_config.build_registry()?;
            check_workloads(&plan, &registry)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(num_cpus::get().max(2))
                .enable_all()
                .build()
                .context("failed to start async runtime")?;

            let result = runtime.block_on(async {
                let engine = Engine::new();
                let control = engine.control();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("\nInterrupted, draining workers...");
                        control.stop(StopReason::Interrupted);
                    }
                });
                engine.run(&plan, &registry).await
            })?;

            if json {
                println!("{}", result.to_json());
            } else {
                result.print();
            }

            if let Some(path) = export_json {
                match std::fs::write(&path, result.to_json()) {
                    Ok(()) => eprintln!("JSON summary written to {}", path.display()),
                    Err(e) => eprintln!("JSON export failed: {}", e),
                }
            }
            if let Some(path) = export_csv {
                let csv = barrage::stats::csv::generate_csv(&result.metrics);
                match std::fs::write(&path, csv) {
                    Ok(()) => eprintln!("CSV summary written to {}", path.display()),
                    Err(e) => eprintln!("CSV export failed: {}", e),
                }
            }

            if !result.passed {
                std::process::exit(THRESHOLD_FAILED_EXIT);
            }
            Ok(())
        }
        Commands::Validate { config } => barrage::cli::validate::run_validate(&config),
        Commands::Init { output } => barrage::cli::init::run_init(output.as_deref()),
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "barrage", &mut std::io::stdout());
            Ok(())
        }
    }
}
