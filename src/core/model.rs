use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::TriageError;

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TriageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| TriageError::Validation(format!("invalid timestamp '{raw}': {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertSubmission {
    pub source: String,
    pub severity: String,
    pub fingerprint: String,
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
}

impl AlertSubmission {
    pub fn validate(&self) -> Result<(), TriageError> {
        for (field, value) in [
            ("source", &self.source),
            ("severity", &self.severity),
            ("fingerprint", &self.fingerprint),
        ] {
            if value.trim().is_empty() {
                return Err(TriageError::Validation(format!(
                    "alert field '{field}' must be non-empty"
                )));
            }
        }
        Ok(())
    }

    /// Normalises an Alertmanager webhook group into a submission. The first
    /// alert of the group names the incident; the whole body is kept as payload.
    pub fn from_alertmanager(body: &Value) -> Result<Self, TriageError> {
        let first = body
            .get("alerts")
            .and_then(Value::as_array)
            .and_then(|alerts| alerts.first())
            .ok_or_else(|| {
                TriageError::Validation("alertmanager payload has no alerts".to_string())
            })?;
        let labels = first.get("labels");
        let label = |key: &str| {
            labels
                .and_then(|l| l.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let alertname = label("alertname");
        let fingerprint = first
            .get("fingerprint")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| alertname.clone());
        let payload = match body {
            Value::Object(map) => map.clone().into_iter().collect(),
            _ => BTreeMap::new(),
        };

        let submission = Self {
            source: "alertmanager".to_string(),
            severity: label("severity"),
            fingerprint,
            payload,
        };
        submission.validate()?;
        Ok(submission)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub source: String,
    pub severity: String,
    pub fingerprint: String,
    pub payload: BTreeMap<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl Alert {
    pub fn from_submission(submission: AlertSubmission, received_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: submission.source.trim().to_string(),
            severity: submission.severity.trim().to_string(),
            fingerprint: submission.fingerprint.trim().to_string(),
            payload: submission.payload,
            received_at,
        }
    }

    /// One-line description used as the first retrieval query.
    pub fn headline(&self) -> String {
        let name = self
            .payload
            .get("alertname")
            .and_then(Value::as_str)
            .or_else(|| {
                self.payload
                    .get("commonLabels")
                    .and_then(|labels| labels.get("alertname"))
                    .and_then(Value::as_str)
            });
        match name {
            Some(name) => format!(
                "{} {} alert from {}: {}",
                self.severity, self.fingerprint, self.source, name
            ),
            None => format!("{} {} alert from {}", self.severity, self.fingerprint, self.source),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub alert_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub job_id: String,
    pub alert_snapshot: Alert,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl QueueMessage {
    pub fn job(&self) -> Job {
        Job {
            id: self.job_id.clone(),
            alert_id: self.alert_snapshot.id.clone(),
            enqueued_at: self.enqueued_at,
            attempt_count: self.attempt_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Approved,
    Corrected,
    Rejected,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        RunStatus::Pending,
        RunStatus::InProgress,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Approved,
        RunStatus::Corrected,
        RunStatus::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Approved => "approved",
            RunStatus::Corrected => "corrected",
            RunStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Failed | RunStatus::Approved | RunStatus::Corrected | RunStatus::Rejected
        )
    }

    /// Finished from the agent's point of view: nothing left to investigate.
    pub fn is_settled(self) -> bool {
        self == RunStatus::Completed || self.is_terminal()
    }

    pub fn is_validated(self) -> bool {
        matches!(self, RunStatus::Approved | RunStatus::Corrected)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::InProgress)
                | (RunStatus::InProgress, RunStatus::Completed)
                | (RunStatus::InProgress, RunStatus::Failed)
                | (RunStatus::Completed, RunStatus::Approved)
                | (RunStatus::Completed, RunStatus::Corrected)
                | (RunStatus::Completed, RunStatus::Rejected)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = TriageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().replace('_', "") == normalized)
            .ok_or_else(|| TriageError::Validation(format!("unknown run status '{raw}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ToolCall,
    Retrieval,
    Thought,
    FinalAnswer,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::ToolCall => "tool_call",
            StepKind::Retrieval => "retrieval",
            StepKind::Thought => "thought",
            StepKind::FinalAnswer => "final_answer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tool_call" => Some(StepKind::ToolCall),
            "retrieval" => Some(StepKind::Retrieval),
            "thought" => Some(StepKind::Thought),
            "final_answer" => Some(StepKind::FinalAnswer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceStep {
    pub sequence_no: u32,
    pub kind: StepKind,
    pub input: Value,
    pub output: Value,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl TraceStep {
    pub fn tool_name(&self) -> Option<&str> {
        if self.kind != StepKind::ToolCall {
            return None;
        }
        self.input.get("tool").and_then(Value::as_str)
    }
}

/// A step as proposed by the agent; the ledger assigns sequence and time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTraceStep {
    pub kind: StepKind,
    pub input: Value,
    pub output: Value,
    pub error: Option<String>,
}

impl NewTraceStep {
    pub fn new(kind: StepKind, input: Value, output: Value) -> Self {
        Self {
            kind,
            input,
            output,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Conclusion {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
    /// Set when the agent assembled the conclusion itself after the budget ran out.
    #[serde(default)]
    pub synthesized: bool,
}

impl Conclusion {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            summary: text.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty() && self.root_cause.is_none()
    }

    pub fn render(&self) -> String {
        let mut text = self.summary.trim().to_string();
        if let Some(root_cause) = self.root_cause.as_deref().filter(|r| !r.trim().is_empty()) {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("Root cause: ");
            text.push_str(root_cause.trim());
        }
        if !self.evidence.is_empty() {
            text.push_str("\nEvidence:");
            for item in &self.evidence {
                text.push_str("\n- ");
                text.push_str(item);
            }
        }
        text
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMetrics {
    pub iterations: u32,
    pub tool_calls: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub alert: Alert,
    pub status: RunStatus,
    pub trace: Vec<TraceStep>,
    pub conclusion: Option<Conclusion>,
    pub corrected_conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metrics: RunMetrics,
    pub ungrounded: bool,
    pub failure_reason: Option<String>,
    pub worker_id: Option<String>,
    pub attempt: u32,
    pub validated_seq: Option<i64>,
}

impl Run {
    /// The reviewer's correction wins over the agent's own conclusion.
    pub fn final_conclusion(&self) -> Option<String> {
        if let Some(corrected) = self
            .corrected_conclusion
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            return Some(corrected.trim().to_string());
        }
        self.conclusion
            .as_ref()
            .filter(|c| !c.is_empty())
            .map(Conclusion::render)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            alert_fingerprint: self.alert.fingerprint.clone(),
            severity: self.alert.severity.clone(),
            status: self.status,
            steps: self.trace.len(),
            metrics: self.metrics,
            ungrounded: self.ungrounded,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub id: String,
    pub alert_fingerprint: String,
    pub severity: String,
    pub status: RunStatus,
    pub steps: usize,
    pub metrics: RunMetrics,
    pub ungrounded: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeChunk {
    pub id: i64,
    pub source_document: String,
    pub chunk_index: usize,
    pub heading_path: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: KnowledgeChunk,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingExample {
    pub run_id: String,
    pub status: RunStatus,
    pub alert: Alert,
    pub trace: Vec<TraceStep>,
    pub final_conclusion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackUpdate {
    pub run_id: String,
    pub new_status: RunStatus,
    #[serde(default)]
    pub corrected_conclusion: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_documented_edges_are_legal() {
        let legal = [
            (RunStatus::Pending, RunStatus::InProgress),
            (RunStatus::InProgress, RunStatus::Completed),
            (RunStatus::InProgress, RunStatus::Failed),
            (RunStatus::Completed, RunStatus::Approved),
            (RunStatus::Completed, RunStatus::Corrected),
            (RunStatus::Completed, RunStatus::Rejected),
        ];
        for from in RunStatus::ALL {
            for to in RunStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
        for terminal in [
            RunStatus::Failed,
            RunStatus::Approved,
            RunStatus::Corrected,
            RunStatus::Rejected,
        ] {
            assert!(terminal.is_terminal());
        }
        assert!(!RunStatus::Completed.is_terminal());
    }

    #[test]
    fn status_parses_loosely() {
        assert_eq!("Approved".parse::<RunStatus>().ok(), Some(RunStatus::Approved));
        assert_eq!("in_progress".parse::<RunStatus>().ok(), Some(RunStatus::InProgress));
        assert_eq!("InProgress".parse::<RunStatus>().ok(), Some(RunStatus::InProgress));
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn submission_requires_identifying_fields() {
        let submission = AlertSubmission {
            source: "prometheus".to_string(),
            severity: "  ".to_string(),
            fingerprint: "cpu-high-podA".to_string(),
            payload: BTreeMap::new(),
        };
        let err = submission.validate().expect_err("blank severity must be rejected");
        assert!(err.to_string().contains("severity"));
    }

    #[test]
    fn alertmanager_group_is_normalised() {
        let body = json!({
            "status": "firing",
            "alerts": [{
                "labels": {"alertname": "HighCPU", "severity": "critical", "pod": "podA"},
                "fingerprint": "abc123"
            }]
        });
        let submission = AlertSubmission::from_alertmanager(&body).expect("normalise");
        assert_eq!(submission.source, "alertmanager");
        assert_eq!(submission.severity, "critical");
        assert_eq!(submission.fingerprint, "abc123");
        assert_eq!(submission.payload.get("status"), Some(&json!("firing")));

        assert!(AlertSubmission::from_alertmanager(&json!({"alerts": []})).is_err());
    }

    #[test]
    fn correction_overrides_conclusion() {
        let alert = Alert::from_submission(
            AlertSubmission {
                source: "prometheus".to_string(),
                severity: "critical".to_string(),
                fingerprint: "mem".to_string(),
                payload: BTreeMap::new(),
            },
            Utc::now(),
        );
        let mut run = Run {
            id: "job-1".to_string(),
            alert,
            status: RunStatus::Completed,
            trace: Vec::new(),
            conclusion: Some(Conclusion {
                summary: "Memory pressure".to_string(),
                root_cause: Some("cache growth".to_string()),
                ..Conclusion::default()
            }),
            corrected_conclusion: None,
            created_at: Utc::now(),
            completed_at: None,
            metrics: RunMetrics::default(),
            ungrounded: false,
            failure_reason: None,
            worker_id: None,
            attempt: 1,
            validated_seq: None,
        };
        assert_eq!(
            run.final_conclusion().as_deref(),
            Some("Memory pressure\nRoot cause: cache growth")
        );
        run.corrected_conclusion = Some("OOM due to leak".to_string());
        assert_eq!(run.final_conclusion().as_deref(), Some("OOM due to leak"));
    }
}
