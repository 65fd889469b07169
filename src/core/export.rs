use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::error::TriageError;
use crate::core::model::{Alert, Run, StepKind, TraceStep, TrainingExample};
use crate::core::ports::ledger::LedgerPort;

/// Position in the stream of validated runs. Runs validated after the cursor
/// are exported; zero exports everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExportCursor(pub i64);

#[derive(Debug, Clone, PartialEq)]
pub struct ExportBatch {
    pub examples: Vec<TrainingExample>,
    /// Pass back to the next export to receive only newer runs.
    pub next_cursor: ExportCursor,
}

/// One JSON Lines record consumed by the fine-tuning job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub instruction: String,
    pub input: String,
    pub output: String,
}

/// Approved and corrected runs validated after `since`, in validation order,
/// so a later verdict only ever appends to earlier output. Runs without a
/// usable conclusion are skipped.
pub fn export(ledger: &dyn LedgerPort, since: ExportCursor) -> Result<ExportBatch, TriageError> {
    let runs = ledger.validated_runs(since.0)?;
    let next_cursor = runs
        .iter()
        .filter_map(|run| run.validated_seq)
        .max()
        .map(ExportCursor)
        .unwrap_or(since)
        .max(since);

    let examples: Vec<TrainingExample> = runs.into_iter().filter_map(example_from_run).collect();
    log::info!(
        "{} example(s) after cursor {}; next cursor {}",
        examples.len(),
        since.0,
        next_cursor.0
    );
    Ok(ExportBatch {
        examples,
        next_cursor,
    })
}

fn example_from_run(run: Run) -> Option<TrainingExample> {
    let Some(final_conclusion) = run.final_conclusion() else {
        log::warn!("skipping run {}: no conclusion to train on", run.id);
        return None;
    };
    Some(TrainingExample {
        run_id: run.id,
        status: run.status,
        alert: run.alert,
        trace: run.trace,
        final_conclusion,
    })
}

pub fn to_record(example: &TrainingExample) -> TrainingRecord {
    TrainingRecord {
        instruction: instruction(&example.alert),
        input: trajectory(&example.trace),
        output: example.final_conclusion.clone(),
    }
}

/// Writes one record per line and returns how many were written.
pub fn write_jsonl<W: Write>(writer: &mut W, examples: &[TrainingExample]) -> Result<usize, TriageError> {
    for example in examples {
        serde_json::to_writer(&mut *writer, &to_record(example))?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(examples.len())
}

fn instruction(alert: &Alert) -> String {
    let alert_json = json!({
        "source": alert.source,
        "severity": alert.severity,
        "fingerprint": alert.fingerprint,
        "payload": alert.payload,
    });
    let pretty = serde_json::to_string_pretty(&alert_json).unwrap_or_else(|_| alert_json.to_string());
    format!(
        "You are an expert SRE agent. You were given the following alert:\n\
         Alert:\n```json\n{pretty}\n```\n\
         You performed an investigation and took the steps in the trajectory below.\n\
         Based on all of this information, what is the final root cause analysis?"
    )
}

fn trajectory(trace: &[TraceStep]) -> String {
    let steps: Vec<String> = trace
        .iter()
        .filter(|step| step.kind == StepKind::ToolCall)
        .enumerate()
        .map(|(index, step)| {
            format!(
                "Step {}:\n- Tool: {}\n- Input: {}\n- Observation: {}",
                index + 1,
                step.tool_name().unwrap_or("unknown"),
                step.input.get("input").map(Value::to_string).unwrap_or_default(),
                observation(step)
            )
        })
        .collect();
    if steps.is_empty() {
        return "Trajectory:\n(no tool calls)".to_string();
    }
    format!("Trajectory:\n{}", steps.join("\n\n"))
}

fn observation(step: &TraceStep) -> String {
    if let Some(error) = &step.error {
        return format!("ERROR: {error}");
    }
    step.output
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
