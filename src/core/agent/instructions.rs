use serde_json::Value;

use crate::core::model::{Alert, Conclusion, StepKind, TraceStep};

const MAX_QUERY_CHARS: usize = 500;
const MAX_EVIDENCE_CHARS: usize = 240;

pub const DEFAULT_INSTRUCTIONS: &str = r#"You are a Level 1 Site Reliability Engineer investigating a production alert.
Your sole mission is to determine the root cause.

Persona:
- Technical, methodical and precise. Clear, concise language.
- Form a hypothesis, then use tools to gather evidence that proves or disproves it.

Rules of engagement:
1. Read the alert carefully; its labels name the affected workload.
2. Consult the runbooks first with search_runbooks when the excerpts provided are not enough.
3. Follow the runbook procedure. Use the tools to gather metrics, logs and cluster state.
4. Take exactly one action per reply: a single tool call, or the final answer.
5. If a tool fails, say what that means for your hypothesis and choose the next step. Never invent tool output.
6. Once the evidence is sufficient, give the final answer: the root cause, then the evidence that supports it."#;

/// Query sent to the knowledge retriever: the alert, refined by the latest
/// observation when one exists.
pub(super) fn retrieval_query(alert: &Alert, last_observation: Option<&str>) -> String {
    let mut parts = vec![alert.headline()];
    for key in ["summary", "description", "message"] {
        if let Some(text) = alert.payload.get(key).and_then(Value::as_str) {
            parts.push(text.to_string());
        }
    }
    if let Some(observation) = last_observation {
        parts.push(observation.to_string());
    }
    let query = parts.join("\n");
    query.chars().take(MAX_QUERY_CHARS).collect()
}

fn clip(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{cut}…")
}

/// Best-effort conclusion assembled from the trace when the oracle could not
/// produce one within budget.
pub(super) fn synthesize_conclusion(alert: &Alert, trace: &[TraceStep], reason: &str) -> Conclusion {
    let evidence: Vec<String> = trace
        .iter()
        .filter(|step| step.kind == StepKind::ToolCall && step.error.is_none())
        .filter_map(|step| {
            let summary = step.output.get("summary").and_then(Value::as_str)?;
            Some(format!(
                "{}: {}",
                step.tool_name().unwrap_or("tool"),
                clip(summary, MAX_EVIDENCE_CHARS)
            ))
        })
        .collect();
    let failed = trace
        .iter()
        .filter(|step| step.kind == StepKind::ToolCall && step.error.is_some())
        .count();

    let mut summary = format!(
        "Investigation of {} stopped ({reason}) before a root cause was confirmed.",
        alert.headline()
    );
    if evidence.is_empty() {
        summary.push_str(" No tool produced usable evidence.");
    } else {
        summary.push_str(&format!(
            " {} observation(s) were gathered; review them below.",
            evidence.len()
        ));
    }
    if failed > 0 {
        summary.push_str(&format!(" {failed} tool call(s) failed."));
    }

    Conclusion {
        summary,
        root_cause: None,
        confidence: Some(0.0),
        evidence,
        synthesized: true,
    }
}
