use serde_json::Value;

use crate::core::model::{Conclusion, RunMetrics, ScoredChunk, StepKind, TraceStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Accepted,
    Resumed,
    Retrieving,
    Thinking,
    ToolCalling,
    Concluding,
    Completed,
    Failed,
}

impl AgentPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Accepted => "accepted",
            AgentPhase::Resumed => "resumed",
            AgentPhase::Retrieving => "retrieving",
            AgentPhase::Thinking => "thinking",
            AgentPhase::ToolCalling => "tool_calling",
            AgentPhase::Concluding => "concluding",
            AgentPhase::Completed => "completed",
            AgentPhase::Failed => "failed",
        }
    }
}

/// Loop state rebuilt from the persisted trace, so a redelivered job picks
/// up exactly where the previous worker stopped.
#[derive(Debug, Default)]
pub(super) struct InvestigationState {
    pub trace: Vec<TraceStep>,
    /// Non-final steps recorded so far; each one costs a unit of budget.
    pub steps_used: u32,
    pub tool_calls: u32,
    pub retrievals: u32,
    /// Whether any retrieval returned at least one chunk.
    pub grounded: bool,
    /// Chunks from the latest retrieval, fed to the oracle.
    pub grounding: Vec<ScoredChunk>,
    pub final_answer: Option<Conclusion>,
}

impl InvestigationState {
    pub fn replay(trace: Vec<TraceStep>) -> Self {
        let mut state = Self::default();
        for step in trace {
            state.record(step);
        }
        state
    }

    pub fn record(&mut self, step: TraceStep) {
        match step.kind {
            StepKind::FinalAnswer => {
                self.final_answer = serde_json::from_value::<Conclusion>(step.output.clone())
                    .ok()
                    .filter(|c| !c.is_empty());
            }
            StepKind::Retrieval => {
                self.steps_used += 1;
                self.retrievals += 1;
                self.grounding = step
                    .output
                    .get("chunks")
                    .cloned()
                    .and_then(|chunks| serde_json::from_value::<Vec<ScoredChunk>>(chunks).ok())
                    .unwrap_or_default();
                self.grounded |= !self.grounding.is_empty();
            }
            StepKind::ToolCall => {
                self.steps_used += 1;
                self.tool_calls += 1;
            }
            StepKind::Thought => {
                self.steps_used += 1;
            }
        }
        self.trace.push(step);
    }

    pub fn last_kind(&self) -> Option<StepKind> {
        self.trace.last().map(|step| step.kind)
    }

    /// Text of the latest tool observation, used to refine retrieval.
    pub fn last_observation(&self) -> Option<&str> {
        self.trace
            .iter()
            .rev()
            .find(|step| step.kind == StepKind::ToolCall && step.error.is_none())
            .and_then(|step| step.output.get("summary"))
            .and_then(Value::as_str)
    }

    pub fn metrics(&self, duration_ms: u64) -> RunMetrics {
        RunMetrics {
            iterations: self.steps_used,
            tool_calls: self.tool_calls,
            duration_ms,
        }
    }
}
