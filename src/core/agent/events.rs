use serde_json::{json, Value};

use crate::core::model::{format_timestamp, TraceStep};
use crate::core::ports::emitter::EmitterPort;

use super::state::AgentPhase;

const PREVIEW_CHARS: usize = 280;

pub(super) fn now_iso() -> String {
    format_timestamp(&chrono::Utc::now())
}

pub(super) fn emit_run_state(
    emitter: &dyn EmitterPort,
    run_id: &str,
    phase: AgentPhase,
    iteration: u32,
    reason: Option<&str>,
) {
    let mut payload = serde_json::Map::new();
    payload.insert("run_id".to_string(), json!(run_id));
    payload.insert("state".to_string(), json!(phase.as_str()));
    payload.insert("iteration".to_string(), json!(iteration));
    payload.insert("ts".to_string(), json!(now_iso()));
    if let Some(reason) = reason {
        payload.insert("reason".to_string(), json!(reason));
    }
    emitter.emit("agent:run_state", &Value::Object(payload));
}

fn preview(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    };
    if text.chars().count() <= PREVIEW_CHARS {
        return text;
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}…")
}

pub(super) fn emit_trace_step(emitter: &dyn EmitterPort, run_id: &str, step: &TraceStep) {
    let mut payload = serde_json::Map::new();
    payload.insert("run_id".to_string(), json!(run_id));
    payload.insert("sequence_no".to_string(), json!(step.sequence_no));
    payload.insert("kind".to_string(), json!(step.kind.as_str()));
    payload.insert("ts".to_string(), json!(format_timestamp(&step.timestamp)));
    if let Some(tool) = step.tool_name() {
        payload.insert("tool".to_string(), json!(tool));
    }
    payload.insert("result_preview".to_string(), json!(preview(&step.output)));
    if let Some(error) = step.error.as_deref() {
        payload.insert("error".to_string(), json!(error));
    }
    emitter.emit("agent:trace_step", &Value::Object(payload));
}

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_retry(
    emitter: &dyn EmitterPort,
    run_id: &str,
    target: &str,
    attempt: u32,
    max_attempts: u32,
    retry_in_ms: u64,
    error: &str,
) {
    emitter.emit(
        "agent:recovery",
        &json!({
            "run_id": run_id,
            "kind": "retry",
            "target": target,
            "attempt": attempt,
            "max_attempts": max_attempts,
            "retry_in_ms": retry_in_ms,
            "error": error,
            "ts": now_iso(),
        }),
    );
}
