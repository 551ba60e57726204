#![forbid(unsafe_code)]

use std::path::PathBuf;

use cow_conformance::{
    HarnessConfig, StructuredCaseLog, emit_case_logs, run_builtin_conformance,
    run_script_conformance,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: run_cow_scenarios [--fixture-root dir] [--scenario name] [--log-output path] [--print-log]";

fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = HarnessConfig::default_paths();
    let mut log_output: Option<PathBuf> = None;
    let mut print_log = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fixture-root" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--fixture-root requires a directory".to_string())?;
                config.fixture_root = PathBuf::from(value);
            }
            "--scenario" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--scenario requires a scenario name".to_string())?;
                config = config.with_scenario_filter(value);
            }
            "--log-output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--log-output requires a file path".to_string())?;
                log_output = Some(PathBuf::from(value));
            }
            "--print-log" => {
                print_log = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let (builtin_report, builtin_cases) = run_builtin_conformance(&config);
    let (script_report, script_cases) = run_script_conformance(&config)?;

    let logs: Vec<&StructuredCaseLog> = builtin_cases
        .iter()
        .map(|case| &case.forensic_log)
        .chain(script_cases.iter().map(|case| &case.forensic_log))
        .collect();

    if print_log {
        for log in &logs {
            println!("{}", log.to_json_line()?);
        }
    }

    let log_entries = match log_output.as_deref() {
        Some(path) => Some(emit_case_logs(logs.iter().copied(), path)?),
        None => None,
    };

    let failed: Vec<&str> = logs
        .iter()
        .filter(|log| !log.passed())
        .map(|log| log.scenario_id.as_str())
        .collect();
    let status = if failed.is_empty() { "ok" } else { "failed" };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": status,
            "builtin": {
                "cases_total": builtin_report.cases_total,
                "cases_passed": builtin_report.cases_passed,
            },
            "scripted": {
                "cases_total": script_report.cases_total,
                "cases_passed": script_report.cases_passed,
            },
            "failed": failed,
            "scenario_filter": config.scenario_filter,
            "log_output": log_output.map(|path| path.display().to_string()),
            "log_entries": log_entries,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} scenario(s) failed", failed.len()))
    }
}
