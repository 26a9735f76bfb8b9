//! Result records.
//!
//! A scheduler run produces one [`TestResultLog`], serialized as a single
//! JSON line on the diagnostic stream, holding a [`TestLog`] per test that
//! ran to completion. Per-test captured output is retained in memory for
//! diagnostics but never serialized.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of a test or of the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    Success,
    Failure,
}

impl TestResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TestResult::Success)
    }
}

/// Per-test record.
#[derive(Debug, Clone, Serialize)]
pub struct TestLog {
    /// Test name, as produced by the list command.
    pub name: String,

    #[serde(rename = "testResult")]
    pub result: TestResult,

    /// Whole seconds from container start to container finish.
    #[serde(rename = "elapsedTimeSec")]
    pub elapsed_sec: i64,

    /// Captured output, newline-joined. Kept for diagnostic streaming only.
    #[serde(skip)]
    pub message: String,
}

/// The `details` object of the result record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestResultLogDetail {
    pub tests: Vec<TestLog>,
}

/// The job-level result record.
#[derive(Debug, Clone, Serialize)]
pub struct TestResultLog {
    #[serde(rename = "testResult")]
    pub result: TestResult,

    /// Job name from the descriptor.
    pub job: String,

    #[serde(rename = "elapsedTimeSec")]
    pub elapsed_sec: i64,

    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,

    pub details: TestResultLogDetail,
}

impl TestResultLog {
    /// Serialize to one JSON line, merging `extra` fields in. Extra fields
    /// override the standard ones on key collision.
    pub fn render(
        &self,
        extra: &HashMap<String, serde_json::Value>,
    ) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            for (k, v) in extra {
                map.insert(k.clone(), v.clone());
            }
        }
        serde_json::to_string(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TestResultLog {
        TestResultLog {
            result: TestResult::Failure,
            job: "unit".into(),
            elapsed_sec: 42,
            started_at: Utc::now(),
            details: TestResultLogDetail {
                tests: vec![TestLog {
                    name: "pkg/alpha".into(),
                    result: TestResult::Success,
                    elapsed_sec: 3,
                    message: "should not appear".into(),
                }],
            },
        }
    }

    #[test]
    fn record_shape() {
        let line = sample().render(&HashMap::new()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["testResult"], "failure");
        assert_eq!(value["job"], "unit");
        assert_eq!(value["elapsedTimeSec"], 42);
        assert!(value["startedAt"].is_string());

        let test = &value["details"]["tests"][0];
        assert_eq!(test["name"], "pkg/alpha");
        assert_eq!(test["testResult"], "success");
        assert_eq!(test["elapsedTimeSec"], 3);
        assert!(test.get("message").is_none());
    }

    #[test]
    fn log_fields_override_standard_keys() {
        let mut extra = HashMap::new();
        extra.insert("job".to_string(), serde_json::json!("renamed"));
        extra.insert("team".to_string(), serde_json::json!("platform"));

        let line = sample().render(&extra).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["job"], "renamed");
        assert_eq!(value["team"], "platform");
    }
}
