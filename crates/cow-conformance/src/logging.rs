use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub ts_utc: String,
    pub suite_id: String,
    pub fixture_id: String,
    pub scenario_id: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        case_name: &str,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            ts_utc: "1970-01-01T00:00:00Z".to_string(),
            suite_id: suite_id.to_string(),
            fixture_id: fixture_id.to_string(),
            scenario_id: format!("{suite_id}:{case_name}"),
            artifact_refs,
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }

    pub fn to_json_line(&self) -> Result<String, String> {
        serde_json::to_string(self)
            .map_err(|error| format!("failed to serialize case log {}: {error}", self.scenario_id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};

    use super::StructuredCaseLog;

    #[test]
    fn json_line_flattens_extra_fields() {
        let mut extra = BTreeMap::new();
        extra.insert("observed_warnings".to_string(), json!(1));
        let log = StructuredCaseLog::new(
            "builtin",
            "builtin_scenarios",
            "read_after_foreign_write",
            vec!["crates/cow-conformance/src/lib.rs".to_string()],
            "cargo test -p cow-conformance".to_string(),
            "pass",
            "warning_count_ok",
        )
        .with_extra_fields(extra);

        let line = log.to_json_line().expect("log should serialize");
        let parsed: Value = serde_json::from_str(&line).expect("line should be json");
        assert_eq!(parsed["scenario_id"], "builtin:read_after_foreign_write");
        assert_eq!(parsed["observed_warnings"], 1);
        assert!(log.passed());
    }
}
