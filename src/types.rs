use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::probes::helper::push_line;

/// What the orchestrator hands to a probe. Never mutated by the probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub display_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl TestDefinition {
    pub fn new(id: &str, kind: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            display_name: display_name.to_string(),
            parameters: Map::new(),
            timeout_ms: None,
            depends_on: Vec::new(),
        }
    }

    /// Builder-style parameter insert, mostly for tests and the CLI.
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }
}

/// Runtime-supplied credentials (PFX passphrase, basic-auth pair).
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl ExecutionContext {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self { username: None, password: Some(password.into()) }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    Pass,
    Fail,
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Network,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    /// Only transport and time-budget failures are worth retrying.
    pub fn is_retry_eligible(self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestError {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingBreakdown {
    pub total_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEvidence {
    /// Probe-specific JSON object.
    pub response_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingBreakdown>,
}

impl TestEvidence {
    /// Serialize a probe-specific evidence struct into the shared shape.
    pub fn from_data<T: Serialize>(data: &T) -> Self {
        let response_data = serde_json::to_value(data)
            .unwrap_or_else(|e| Value::String(format!("unserializable evidence: {}", e)));
        Self {
            response_data,
            response_code: None,
            response_headers: None,
            timing: None,
        }
    }

    pub fn with_timing(mut self, timing: TimingBreakdown) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Flat `label: value` rendering used by text views and the CLI.
    pub fn to_display_text(&self) -> String {
        let mut out = String::new();
        match &self.response_data {
            Value::Object(map) => {
                for (k, v) in map {
                    push_line(&mut out, k, &flatten_value(v));
                }
            }
            other => push_line(&mut out, "responseData", &flatten_value(other)),
        }
        if let Some(code) = self.response_code {
            push_line(&mut out, "responseCode", &code.to_string());
        }
        if let Some(headers) = &self.response_headers {
            for (k, v) in headers {
                push_line(&mut out, &format!("header.{}", k), v);
            }
        }
        if let Some(t) = &self.timing {
            push_line(&mut out, "totalMs", &t.total_ms.to_string());
            if let Some(c) = t.connect_ms {
                push_line(&mut out, "connectMs", &c.to_string());
            }
            if let Some(e) = t.execute_ms {
                push_line(&mut out, "executeMs", &e.to_string());
            }
        }
        out
    }
}

fn flatten_value(v: &Value) -> String {
    match v {
        Value::Null => "(none)".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            if items.is_empty() {
                "(none)".to_string()
            } else {
                items.iter().map(flatten_value).collect::<Vec<_>>().join(", ")
            }
        }
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}={}", k, flatten_value(v)))
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_id: String,
    pub test_type: String,
    pub display_name: String,
    pub status: TestStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub human_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<TestEvidence>,
}

impl TestResult {
    pub fn is_pass(&self) -> bool {
        self.status == TestStatus::Pass
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        self.error.as_ref().map(|e| e.category)
    }

    pub fn to_display_text(&self) -> String {
        let mut out = String::new();
        push_line(&mut out, "Test", &format!("{} ({})", self.display_name, self.test_id));
        push_line(&mut out, "Status", &self.status.to_string());
        push_line(&mut out, "Summary", &self.human_summary);
        push_line(&mut out, "Duration", &format!("{} ms", self.duration_ms));
        if let Some(err) = &self.error {
            push_line(&mut out, "Error", &format!("[{}] {}", err.category, err.message));
        }
        if let Some(details) = &self.technical_details {
            push_line(&mut out, "Details", details);
        }
        if let Some(ev) = &self.evidence {
            out.push('\n');
            out.push_str(&ev.to_display_text());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_parses_camel_case() {
        let raw = json!({
            "id": "t1",
            "type": "websocket",
            "displayName": "Echo",
            "parameters": {"url": "ws://x", "timeoutMs": 500},
            "timeoutMs": 2000,
            "dependsOn": ["t0"]
        });
        let def: TestDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.kind, "websocket");
        assert_eq!(def.timeout_ms, Some(2000));
        assert_eq!(def.depends_on, vec!["t0".to_string()]);
        let keys: Vec<_> = def.parameters.keys().cloned().collect();
        assert_eq!(keys, vec!["url", "timeoutMs"]);
    }

    #[test]
    fn context_debug_redacts_password() {
        let ctx = ExecutionContext {
            username: Some("svc".into()),
            password: Some("hunter2".into()),
        };
        let dbg = format!("{:?}", ctx);
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
        assert!(!serde_json::to_string(&ctx).unwrap().contains("hunter2"));
    }

    #[test]
    fn retry_eligibility() {
        assert!(ErrorCategory::Network.is_retry_eligible());
        assert!(ErrorCategory::Timeout.is_retry_eligible());
        assert!(!ErrorCategory::Configuration.is_retry_eligible());
        assert!(!ErrorCategory::Validation.is_retry_eligible());
        assert!(!ErrorCategory::Unknown.is_retry_eligible());
    }

    #[test]
    fn evidence_text_is_flat() {
        let ev = TestEvidence {
            response_data: json!({"subject": "CN=a", "sans": ["a", "b"], "skipped": false}),
            response_code: Some(200),
            response_headers: None,
            timing: Some(TimingBreakdown { total_ms: 12, connect_ms: Some(3), execute_ms: None }),
        };
        let text = ev.to_display_text();
        assert!(text.contains("subject: CN=a"));
        assert!(text.contains("sans: a, b"));
        assert!(text.contains("skipped: false"));
        assert!(text.contains("responseCode: 200"));
        assert!(text.contains("connectMs: 3"));
        assert!(!text.contains("executeMs"));
    }
}
