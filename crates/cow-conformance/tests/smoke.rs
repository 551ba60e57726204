use std::sync::Arc;

use cow_api::{CowSession, TensorHandle};
use cow_conformance::{
    HarnessConfig, emit_case_logs, find_scenario, run_builtin_conformance, run_scenario,
    run_script_conformance, run_smoke,
};
use cow_core::{ConflictKind, Token, TrackingState};
use cow_runtime::{CounterScope, LedgerSink, SharedSink, get_counter, reset_counter};

#[test]
fn smoke_report_is_green() {
    let cfg = HarnessConfig::default_paths();
    let report = run_smoke(&cfg);
    assert_eq!(report.suite, "smoke");
    assert!(report.fixture_count >= 1);
    assert!(report.cases_total >= 20);
    assert!(report.is_green());
}

#[test]
fn documented_scenarios_produce_expected_counts() {
    for (name, expected) in [
        ("read_after_foreign_write", 1),
        ("rebound_storage_reads_foreign_write", 1),
        ("plain_views_never_track", 0),
        ("view_then_reshape_source_writes", 0),
        ("view_of_reshape_reads_reshape_write", 0),
        ("reshape_reads_its_view_write", 0),
    ] {
        let scenario = find_scenario(name).expect("scenario should be registered");
        assert_eq!(scenario.expected_warnings, expected);
        let report = run_scenario(scenario);
        assert_eq!(report.observed_warnings, expected, "scenario {name}");
    }
}

#[test]
fn counter_reset_and_read_are_independent() {
    let scope = CounterScope::begin();
    let mut a = TensorHandle::new();
    let b = a.reshape_as_view();
    let _ = a.write_data();
    let _ = b.read_data();
    let _ = b.read_data();
    assert_eq!(get_counter(), 2);
    assert_eq!(get_counter(), 2);

    scope.reset();
    assert_eq!(get_counter(), 0);
    let _ = b.read_data();
    assert_eq!(scope.count(), 1);

    reset_counter();
    assert_eq!(scope.count(), 0);
}

#[test]
fn builtin_and_scripted_suites_are_green() {
    let cfg = HarnessConfig::default_paths();
    let (builtin, builtin_cases) = run_builtin_conformance(&cfg);
    let (scripted, scripted_cases) =
        run_script_conformance(&cfg).expect("scripted conformance should run");

    assert!(builtin.is_green(), "builtin failures: {builtin_cases:?}");
    assert!(scripted.is_green(), "scripted failures: {scripted_cases:?}");
}

#[test]
fn case_logs_are_written_as_json_lines() {
    let cfg = HarnessConfig::default_paths().with_scenario_filter("sibling_reshapes");
    let (_, builtin_cases) = run_builtin_conformance(&cfg);
    let (_, scripted_cases) = run_script_conformance(&cfg).expect("scripted run should work");
    let output = std::env::temp_dir().join(format!(
        "cow_conformance_smoke_{}.jsonl",
        std::process::id()
    ));

    let written = emit_case_logs(
        builtin_cases
            .iter()
            .map(|case| &case.forensic_log)
            .chain(scripted_cases.iter().map(|case| &case.forensic_log)),
        &output,
    )
    .expect("logs should be written");
    let raw = std::fs::read_to_string(&output).expect("log file should be readable");
    let _ = std::fs::remove_file(&output);

    assert_eq!(written, 2);
    assert_eq!(raw.lines().count(), 2);
    for line in raw.lines() {
        let parsed: serde_json::Value = serde_json::from_str(line).expect("line should be json");
        assert_eq!(parsed["outcome"], "pass");
    }
}

#[test]
fn tracking_state_walks_untracked_tracked_owned() {
    let session = CowSession::new();
    let mut a = session.tensor();
    assert_eq!(a.tracking_state(), TrackingState::Untracked);

    let b = a.reshape_as_view();
    assert_eq!(
        b.tracking_state(),
        TrackingState::Tracked { first_writer: None }
    );

    let _ = a.write_data();
    assert_eq!(
        b.tracking_state(),
        TrackingState::Tracked {
            first_writer: Some(Token::FIRST_GROUP)
        }
    );

    let _ = b.read_data();
    let _ = a.reshape_as_view();
    assert_eq!(
        a.tracking_state(),
        TrackingState::Tracked {
            first_writer: Some(Token::FIRST_GROUP)
        }
    );
    assert_eq!(session.conflict_count_of(ConflictKind::ReadAfterWrite), 1);
}

#[test]
fn custom_sink_receives_conflicts_from_views_and_clones() {
    let sink = Arc::new(LedgerSink::new());
    let shared: SharedSink = sink.clone();
    let mut a = TensorHandle::new_with_sink(shared);
    let mut b = a.reshape_as_view();
    let mut c = a.clone();
    let d = c.reshape_as_view();

    let _ = a.write_data();
    let _ = b.write_data();
    let _ = c.write_data();
    let _ = d.read_data();

    let ledger = sink.snapshot();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger.count_kind(ConflictKind::WriteAfterWrite), 1);
    assert_eq!(ledger.count_kind(ConflictKind::ReadAfterWrite), 1);
    assert_ne!(
        ledger.entries()[0].conflict.storage_id,
        ledger.entries()[1].conflict.storage_id
    );
}
