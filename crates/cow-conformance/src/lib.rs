#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use cow_api::{CowSession, ReshapeMode, TensorHandle};
use cow_core::ConflictKind;
use cow_runtime::CounterScope;
use serde::Deserialize;
use serde_json::json;

pub use logging::StructuredCaseLog;

const MAX_FIXTURE_BYTES: u64 = 1 << 20;
const SCRIPT_FIXTURE: &str = "cow_scenarios.json";
const LOG_TARGET: &str = "cow_conformance";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    /// Only run cases whose name matches exactly.
    pub scenario_filter: Option<String>,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            scenario_filter: None,
        }
    }

    #[must_use]
    pub fn with_scenario_filter(mut self, name: impl Into<String>) -> Self {
        self.scenario_filter = Some(name.into());
        self
    }

    fn selects(&self, name: &str) -> bool {
        self.scenario_filter
            .as_deref()
            .is_none_or(|filter| filter == name)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.cases_total == self.cases_passed
    }
}

/// A named aliasing graph and the warnings it must produce.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub expected_warnings: u64,
    pub run: fn(),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    pub name: String,
    pub expected_warnings: u64,
    pub observed_warnings: u64,
    pub forensic_log: StructuredCaseLog,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.expected_warnings == self.observed_warnings
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCaseReport {
    pub name: String,
    pub expected_warnings: u64,
    pub counter_warnings: u64,
    pub ledger_warnings: u64,
    pub kinds_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl ScriptCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.counter_warnings == self.expected_warnings
            && self.ledger_warnings == self.expected_warnings
            && self.kinds_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptFixtureFile {
    cases: Vec<ScriptCase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptCase {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<ScriptStep>,
    pub expected_warnings: u64,
    #[serde(default)]
    pub expected_read_conflicts: Option<u64>,
    #[serde(default)]
    pub expected_write_conflicts: Option<u64>,
}

/// One operation of a scripted aliasing scenario.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    New { out: String },
    View { src: String, out: String },
    ReshapeView { src: String, out: String },
    ReshapeCopy { src: String, out: String },
    Clone { src: String, out: String },
    Alias { dst: String, src: String },
    Write { target: String },
    Read { target: String },
    Drop { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    UnknownTensor { step: usize, name: String },
    DuplicateTensor { step: usize, name: String },
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTensor { step, name } => {
                write!(f, "step {step} references unknown tensor '{name}'")
            }
            Self::DuplicateTensor { step, name } => {
                write!(f, "step {step} redefines tensor '{name}'")
            }
        }
    }
}

impl std::error::Error for ScriptError {}

/// Runs `steps` against tensors produced by `make_tensor`.
pub fn execute_script<F>(steps: &[ScriptStep], make_tensor: F) -> Result<(), ScriptError>
where
    F: Fn() -> TensorHandle,
{
    let mut tensors: BTreeMap<String, TensorHandle> = BTreeMap::new();
    for (step, op) in steps.iter().enumerate() {
        match op {
            ScriptStep::New { out } => bind(&mut tensors, step, out, make_tensor())?,
            ScriptStep::View { src, out } => {
                let derived = lookup(&tensors, step, src)?.view();
                bind(&mut tensors, step, out, derived)?;
            }
            ScriptStep::ReshapeView { src, out } => {
                let derived = lookup(&tensors, step, src)?.reshape_as_view();
                bind(&mut tensors, step, out, derived)?;
            }
            ScriptStep::ReshapeCopy { src, out } => {
                let derived = lookup(&tensors, step, src)?.reshape(ReshapeMode::Copy);
                bind(&mut tensors, step, out, derived)?;
            }
            ScriptStep::Clone { src, out } => {
                let derived = lookup(&tensors, step, src)?.clone();
                bind(&mut tensors, step, out, derived)?;
            }
            ScriptStep::Alias { dst, src } => {
                let source = lookup(&tensors, step, src)?.view();
                let target = tensors
                    .get_mut(dst.as_str())
                    .ok_or_else(|| ScriptError::UnknownTensor {
                        step,
                        name: dst.clone(),
                    })?;
                target.set_storage_from(&source);
            }
            ScriptStep::Write { target } => {
                let tensor = tensors
                    .get_mut(target.as_str())
                    .ok_or_else(|| ScriptError::UnknownTensor {
                        step,
                        name: target.clone(),
                    })?;
                let _ = tensor.write_data();
            }
            ScriptStep::Read { target } => {
                let _ = lookup(&tensors, step, target)?.read_data();
            }
            ScriptStep::Drop { target } => {
                tensors
                    .remove(target.as_str())
                    .ok_or_else(|| ScriptError::UnknownTensor {
                        step,
                        name: target.clone(),
                    })?;
            }
        }
    }
    Ok(())
}

fn lookup<'a>(
    tensors: &'a BTreeMap<String, TensorHandle>,
    step: usize,
    name: &str,
) -> Result<&'a TensorHandle, ScriptError> {
    tensors
        .get(name)
        .ok_or_else(|| ScriptError::UnknownTensor {
            step,
            name: name.to_string(),
        })
}

fn bind(
    tensors: &mut BTreeMap<String, TensorHandle>,
    step: usize,
    name: &str,
    tensor: TensorHandle,
) -> Result<(), ScriptError> {
    if tensors.contains_key(name) {
        return Err(ScriptError::DuplicateTensor {
            step,
            name: name.to_string(),
        });
    }
    tensors.insert(name.to_string(), tensor);
    Ok(())
}

fn scenario_read_after_foreign_write() {
    let mut a = TensorHandle::new();
    let b = a.reshape_as_view();
    let _ = a.write_data();
    let _ = b.read_data();
}

fn scenario_rebound_storage_reads_foreign_write() {
    let a = TensorHandle::new();
    let mut c = TensorHandle::new();
    c.set_storage_from(&a);
    let mut b = a.reshape_as_view();
    let _ = b.write_data();
    let _ = c.read_data();
}

fn scenario_plain_views_never_track() {
    let mut a = TensorHandle::new();
    let mut b = a.view();
    let _ = a.write_data();
    let _ = b.write_data();
    let _ = a.read_data();
    let _ = b.read_data();
}

fn scenario_view_then_reshape_source_writes() {
    let mut a = TensorHandle::new();
    let b = a.view();
    let _c = a.reshape_as_view();
    let _ = a.write_data();
    let _ = b.read_data();
}

fn scenario_view_of_reshape_reads_reshape_write() {
    let a = TensorHandle::new();
    let mut b = a.reshape_as_view();
    let c = b.view();
    let _ = b.write_data();
    let _ = c.read_data();
}

fn scenario_reshape_reads_its_view_write() {
    let a = TensorHandle::new();
    let b = a.reshape_as_view();
    let mut c = b.view();
    let _ = c.write_data();
    let _ = b.read_data();
}

fn scenario_view_writes_source_reads() {
    let a = TensorHandle::new();
    let mut b = a.view();
    let _c = a.reshape_as_view();
    let _ = b.write_data();
    let _ = a.read_data();
}

fn scenario_reshape_reads_source_write() {
    let mut a = TensorHandle::new();
    let _b = a.view();
    let c = a.reshape_as_view();
    let _ = a.write_data();
    let _ = c.read_data();
}

fn scenario_source_reads_reshape_write() {
    let a = TensorHandle::new();
    let _b = a.view();
    let mut c = a.reshape_as_view();
    let _ = c.write_data();
    let _ = a.read_data();
}

fn scenario_reshape_reads_view_write() {
    let a = TensorHandle::new();
    let mut b = a.view();
    let c = a.reshape_as_view();
    let _ = b.write_data();
    let _ = c.read_data();
}

fn scenario_view_reads_reshape_write() {
    let a = TensorHandle::new();
    let b = a.view();
    let mut c = a.reshape_as_view();
    let _ = c.write_data();
    let _ = b.read_data();
}

fn scenario_reshape_of_view_source_writes() {
    let mut a = TensorHandle::new();
    let b = a.view();
    let _c = b.reshape_as_view();
    let _ = a.write_data();
    let _ = b.read_data();
}

fn scenario_reshape_of_view_view_writes_source_reads() {
    let a = TensorHandle::new();
    let mut b = a.view();
    let _c = b.reshape_as_view();
    let _ = b.write_data();
    let _ = a.read_data();
}

fn scenario_sibling_reshapes() {
    let a = TensorHandle::new();
    let mut b = a.reshape_as_view();
    let c = a.reshape_as_view();
    let _ = b.write_data();
    let _ = c.read_data();
}

fn scenario_repeated_foreign_writes() {
    let mut a = TensorHandle::new();
    let mut b = a.reshape_as_view();
    let _ = a.write_data();
    let _ = b.write_data();
    let _ = b.write_data();
    let _ = a.read_data();
}

fn scenario_clone_is_isolated() {
    let mut a = TensorHandle::new();
    let _b = a.reshape_as_view();
    let mut c = a.clone();
    let _ = a.write_data();
    let _ = c.read_data();
    let _ = c.write_data();
    let _ = a.read_data();
}

pub const BUILTIN_SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "read_after_foreign_write",
        expected_warnings: 1,
        run: scenario_read_after_foreign_write,
    },
    Scenario {
        name: "rebound_storage_reads_foreign_write",
        expected_warnings: 1,
        run: scenario_rebound_storage_reads_foreign_write,
    },
    Scenario {
        name: "plain_views_never_track",
        expected_warnings: 0,
        run: scenario_plain_views_never_track,
    },
    Scenario {
        name: "view_then_reshape_source_writes",
        expected_warnings: 0,
        run: scenario_view_then_reshape_source_writes,
    },
    Scenario {
        name: "view_of_reshape_reads_reshape_write",
        expected_warnings: 0,
        run: scenario_view_of_reshape_reads_reshape_write,
    },
    Scenario {
        name: "reshape_reads_its_view_write",
        expected_warnings: 0,
        run: scenario_reshape_reads_its_view_write,
    },
    Scenario {
        name: "view_writes_source_reads",
        expected_warnings: 0,
        run: scenario_view_writes_source_reads,
    },
    Scenario {
        name: "reshape_reads_source_write",
        expected_warnings: 1,
        run: scenario_reshape_reads_source_write,
    },
    Scenario {
        name: "source_reads_reshape_write",
        expected_warnings: 1,
        run: scenario_source_reads_reshape_write,
    },
    Scenario {
        name: "reshape_reads_view_write",
        expected_warnings: 1,
        run: scenario_reshape_reads_view_write,
    },
    Scenario {
        name: "view_reads_reshape_write",
        expected_warnings: 1,
        run: scenario_view_reads_reshape_write,
    },
    Scenario {
        name: "reshape_of_view_source_writes",
        expected_warnings: 0,
        run: scenario_reshape_of_view_source_writes,
    },
    Scenario {
        name: "reshape_of_view_view_writes_source_reads",
        expected_warnings: 0,
        run: scenario_reshape_of_view_view_writes_source_reads,
    },
    Scenario {
        name: "sibling_reshapes",
        expected_warnings: 1,
        run: scenario_sibling_reshapes,
    },
    Scenario {
        name: "repeated_foreign_writes",
        expected_warnings: 2,
        run: scenario_repeated_foreign_writes,
    },
    Scenario {
        name: "clone_is_isolated",
        expected_warnings: 0,
        run: scenario_clone_is_isolated,
    },
];

#[must_use]
pub fn find_scenario(name: &str) -> Option<&'static Scenario> {
    BUILTIN_SCENARIOS
        .iter()
        .find(|scenario| scenario.name == name)
}

/// Resets the warning counter, runs the scenario, and reads the counter back.
#[must_use]
pub fn run_scenario(scenario: &Scenario) -> ScenarioReport {
    let scope = CounterScope::begin();
    (scenario.run)();
    let observed_warnings = scope.count();
    drop(scope);

    let passed = observed_warnings == scenario.expected_warnings;
    tracing::info!(
        target: LOG_TARGET,
        scenario = scenario.name,
        expected = scenario.expected_warnings,
        observed = observed_warnings,
        passed,
        "builtin scenario finished"
    );
    let (outcome, reason_code) = outcome_fields(passed);
    let mut extra_fields = BTreeMap::new();
    extra_fields.insert(
        "expected_warnings".to_string(),
        json!(scenario.expected_warnings),
    );
    extra_fields.insert("observed_warnings".to_string(), json!(observed_warnings));

    ScenarioReport {
        name: scenario.name.to_string(),
        expected_warnings: scenario.expected_warnings,
        observed_warnings,
        forensic_log: StructuredCaseLog::new(
            "builtin",
            "builtin_scenarios",
            scenario.name,
            vec!["crates/cow-conformance/src/lib.rs".to_string()],
            format!(
                "cargo run -p cow-conformance --bin run_cow_scenarios -- --scenario {}",
                scenario.name
            ),
            outcome,
            reason_code,
        )
        .with_extra_fields(extra_fields),
    }
}

#[must_use]
pub fn run_builtin_conformance(config: &HarnessConfig) -> (HarnessReport, Vec<ScenarioReport>) {
    let reports: Vec<ScenarioReport> = BUILTIN_SCENARIOS
        .iter()
        .filter(|scenario| config.selects(scenario.name))
        .map(run_scenario)
        .collect();
    let (cases_total, cases_passed) = summarize_passes(reports.iter().map(ScenarioReport::passed));
    let report = HarnessReport {
        suite: "builtin",
        fixture_count: 0,
        cases_total,
        cases_passed,
    };
    (report, reports)
}

pub fn run_script_case(case: &ScriptCase) -> Result<ScriptCaseReport, String> {
    let scope = CounterScope::begin();
    execute_script(&case.steps, TensorHandle::new)
        .map_err(|error| format!("script '{}' failed on counter run: {error}", case.name))?;
    let counter_warnings = scope.count();
    drop(scope);

    let session = CowSession::new();
    execute_script(&case.steps, || session.tensor())
        .map_err(|error| format!("script '{}' failed on ledger run: {error}", case.name))?;
    let ledger = session.conflicts();
    let ledger_warnings = ledger.len() as u64;
    let read_conflicts = ledger.count_kind(ConflictKind::ReadAfterWrite) as u64;
    let write_conflicts = ledger.count_kind(ConflictKind::WriteAfterWrite) as u64;
    let kinds_ok = case
        .expected_read_conflicts
        .is_none_or(|expected| expected == read_conflicts)
        && case
            .expected_write_conflicts
            .is_none_or(|expected| expected == write_conflicts);

    let passed = counter_warnings == case.expected_warnings
        && ledger_warnings == case.expected_warnings
        && kinds_ok;
    if !passed {
        tracing::warn!(
            target: LOG_TARGET,
            case = case.name.as_str(),
            expected = case.expected_warnings,
            counter_warnings,
            ledger_warnings,
            read_conflicts,
            write_conflicts,
            "scripted case mismatch"
        );
    }
    let (outcome, reason_code) = if passed {
        outcome_fields(true)
    } else if !kinds_ok {
        ("fail", "conflict_kind_mismatch")
    } else {
        outcome_fields(false)
    };

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert(
        "expected_warnings".to_string(),
        json!(case.expected_warnings),
    );
    extra_fields.insert("counter_warnings".to_string(), json!(counter_warnings));
    extra_fields.insert("ledger_warnings".to_string(), json!(ledger_warnings));
    extra_fields.insert("read_conflicts".to_string(), json!(read_conflicts));
    extra_fields.insert("write_conflicts".to_string(), json!(write_conflicts));
    extra_fields.insert(
        "conflicts".to_string(),
        json!(
            ledger
                .entries()
                .iter()
                .map(|entry| entry.conflict.to_string())
                .collect::<Vec<_>>()
        ),
    );
    if let Some(description) = &case.description {
        extra_fields.insert("description".to_string(), json!(description));
    }

    Ok(ScriptCaseReport {
        name: case.name.clone(),
        expected_warnings: case.expected_warnings,
        counter_warnings,
        ledger_warnings,
        kinds_ok,
        forensic_log: StructuredCaseLog::new(
            "scripted",
            SCRIPT_FIXTURE,
            case.name.as_str(),
            vec![format!("crates/cow-conformance/fixtures/{SCRIPT_FIXTURE}")],
            format!(
                "cargo run -p cow-conformance --bin run_cow_scenarios -- --scenario {}",
                case.name
            ),
            outcome,
            reason_code,
        )
        .with_extra_fields(extra_fields),
    })
}

pub fn run_script_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<ScriptCaseReport>), String> {
    let fixture_path = config.fixture_root.join(SCRIPT_FIXTURE);
    let fixture: ScriptFixtureFile = load_fixture(&fixture_path)?;

    let mut reports = Vec::with_capacity(fixture.cases.len());
    for case in fixture
        .cases
        .iter()
        .filter(|case| config.selects(case.name.as_str()))
    {
        reports.push(run_script_case(case)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(reports.iter().map(ScriptCaseReport::passed));
    let report = HarnessReport {
        suite: "scripted",
        fixture_count: 1,
        cases_total,
        cases_passed,
    };
    Ok((report, reports))
}

/// Runs both suites. A scripted fixture that cannot be loaded or executed
/// counts as one failed case.
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let (builtin, _) = run_builtin_conformance(config);
    let (scripted_total, scripted_passed) = match run_script_conformance(config) {
        Ok((report, _)) => (report.cases_total, report.cases_passed),
        Err(error) => {
            tracing::warn!(target: LOG_TARGET, %error, "scripted suite did not run");
            (1, 0)
        }
    };
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    HarnessReport {
        suite: "smoke",
        fixture_count,
        cases_total: builtin.cases_total + scripted_total,
        cases_passed: builtin.cases_passed + scripted_passed,
    }
}

/// Writes one JSON line per case log and returns how many were written.
pub fn emit_case_logs<'a, I>(logs: I, output_path: &Path) -> Result<usize, String>
where
    I: IntoIterator<Item = &'a StructuredCaseLog>,
{
    let mut raw = String::new();
    let mut count = 0usize;
    for log in logs {
        raw.push_str(log.to_json_line()?.as_str());
        raw.push('\n');
        count += 1;
    }
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create log directory {}: {error}",
                parent.display()
            )
        })?;
    }
    fs::write(output_path, raw)
        .map_err(|error| format!("failed to write {}: {error}", output_path.display()))?;
    Ok(count)
}

fn outcome_fields(passed: bool) -> (&'static str, &'static str) {
    if passed {
        ("pass", "warning_count_ok")
    } else {
        ("fail", "warning_count_mismatch")
    }
}

/// Reads a scenario fixture, refusing files over [`MAX_FIXTURE_BYTES`]
/// before any of it is parsed.
fn load_fixture<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, String> {
    let shown = path.display();
    let len = fs::metadata(path)
        .map_err(|error| format!("cannot stat scenario fixture {shown}: {error}"))?
        .len();
    if len > MAX_FIXTURE_BYTES {
        return Err(format!(
            "scenario fixture {shown} is {len} bytes, over the {MAX_FIXTURE_BYTES} byte cap"
        ));
    }
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("cannot read scenario fixture {shown}: {error}"))?;
    serde_json::from_str(&raw)
        .map_err(|error| format!("scenario fixture {shown} is not valid: {error}"))
}

/// Folds per-case outcomes into `(cases_total, cases_passed)`.
fn summarize_passes(outcomes: impl Iterator<Item = bool>) -> (usize, usize) {
    outcomes.fold((0, 0), |(total, passed), ok| (total + 1, passed + usize::from(ok)))
}
