//! CLI entrypoint for the poolguard harness.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use poolguard_harness::structured_log::{
    ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome, StreamKind, validate_log_file,
};
use poolguard_harness::{HarnessError, StressConfig, run_all, run_stress};
use poolguard_membrane::CheckMode;

/// Verification tooling for poolguard.
#[derive(Debug, Parser)]
#[command(name = "poolguard-harness")]
#[command(about = "Scenario, stress and log-validation harness for poolguard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the misuse scenarios and log one result per scenario.
    Scenarios {
        /// JSONL log path.
        #[arg(long, default_value = "poolguard-scenarios.jsonl")]
        log: PathBuf,
        /// Artifact index path (JSON). Skipped when omitted.
        #[arg(long)]
        index: Option<PathBuf>,
        /// Run id embedded in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Seeded alloc/free/check churn; prints the report as JSON.
    Stress {
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long, default_value_t = 10_000)]
        steps: usize,
        #[arg(long, default_value_t = 16)]
        node_size: usize,
        #[arg(long, default_value_t = 256)]
        max_request: usize,
        /// Disable shadow pages for the run.
        #[arg(long)]
        no_dangling: bool,
    },
    /// Validate a JSONL harness log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn scenarios(log: &Path, index: Option<&Path>, run_id: &str) -> Result<bool, HarnessError> {
    let mode = CheckMode::Enforce.as_str();
    let mut emitter = LogEmitter::to_file(log, run_id)?;
    emitter.emit(
        LogEntry::new("", LogLevel::Info, "run_start")
            .with_stream(StreamKind::Scenario)
            .with_mode(mode),
    )?;

    let reports = run_all()?;
    let mut failed = 0;
    for report in &reports {
        let (level, outcome) = if report.passed {
            (LogLevel::Info, Outcome::Pass)
        } else {
            failed += 1;
            (LogLevel::Error, Outcome::Fail)
        };
        let mut entry = LogEntry::new("", level, "scenario_result")
            .with_stream(StreamKind::Scenario)
            .with_mode(mode)
            .with_scenario(report.name)
            .with_outcome(outcome)
            .with_duration_us(report.duration_us)
            .with_details(report.details.clone());
        if let Some(kind) = report.violation {
            entry = entry.with_violation(kind.as_str());
        }
        emitter.emit(entry)?;
        println!(
            "{:<32} {}",
            report.name,
            if report.passed { "pass" } else { "FAIL" }
        );
    }

    let mut end = LogEntry::new("", LogLevel::Info, "run_end")
        .with_stream(StreamKind::Scenario)
        .with_outcome(if failed == 0 { Outcome::Pass } else { Outcome::Fail })
        .with_details(serde_json::json!({ "total": reports.len(), "failed": failed }));
    if let Some(index_path) = index {
        end = end.with_artifacts(vec![index_path.display().to_string()]);
    }
    emitter.emit(end)?;
    emitter.flush()?;

    if let Some(index_path) = index {
        let mut artifacts = ArtifactIndex::new(run_id);
        artifacts.add_file(log, "scenario_log")?;
        std::fs::write(index_path, artifacts.to_json()?)?;
    }
    Ok(failed == 0)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Scenarios { log, index, run_id } => scenarios(&log, index.as_deref(), &run_id),
        Command::Stress {
            seed,
            steps,
            node_size,
            max_request,
            no_dangling,
        } => run_stress(&StressConfig {
            seed,
            steps,
            node_size,
            max_request,
            dangling: !no_dangling,
        })
        .and_then(|report| {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }),
        Command::ValidateLog { log } => validate_log_file(&log)
            .map_err(HarnessError::from)
            .map(|(count, errors)| {
                for error in &errors {
                    eprintln!("{error}");
                }
                println!("{count} entries, {} errors", errors.len());
                errors.is_empty()
            }),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("poolguard-harness: {err}");
            ExitCode::from(2)
        }
    }
}
