use serde_json::{json, Value};

use crate::adapters::rag::format_grounding;
use crate::core::model::{Alert, StepKind, TraceStep};
use crate::core::ports::oracle::OracleContext;
use crate::core::ports::tools::ToolDefinition;

const CONCLUDE_NOW: &str = "Your investigation budget is spent. Do not call any more tools. Give your Final Answer now, based only on the evidence gathered so far.";

pub(super) fn alert_block(alert: &Alert) -> String {
    let body = json!({
        "source": alert.source,
        "severity": alert.severity,
        "fingerprint": alert.fingerprint,
        "received_at": crate::core::model::format_timestamp(&alert.received_at),
        "payload": alert.payload,
    });
    let pretty = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
    format!("An alert has fired. Here is the alert data in JSON format:\n{pretty}")
}

fn grounding_block(context: &OracleContext<'_>) -> Option<String> {
    if context.grounding.is_empty() {
        return None;
    }
    Some(format!(
        "Relevant runbook excerpts:\n\n{}",
        format_grounding(context.grounding)
    ))
}

/// Text the model sees as the result of a tool call.
pub(super) fn observation_text(step: &TraceStep) -> String {
    if let Some(error) = step.error.as_deref() {
        return format!("ERROR: {error}");
    }
    match step.output.get("summary").and_then(Value::as_str) {
        Some(summary) => summary.to_string(),
        None => step.output.to_string(),
    }
}

pub(super) fn tool_input(step: &TraceStep) -> Value {
    step.input.get("input").cloned().unwrap_or_else(|| json!({}))
}

fn tool_catalog(tools: &[ToolDefinition]) -> String {
    tools
        .iter()
        .map(|tool| format!("{}: {}\n  input schema: {}", tool.name, tool.description, tool.input_schema))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Messages for backends with native function calling. Prior tool calls are
/// replayed as assistant/tool message pairs keyed by sequence number.
pub(super) fn native_messages(context: &OracleContext<'_>) -> Vec<Value> {
    let mut system = context.instructions.trim().to_string();
    if context.must_conclude {
        system.push_str("\n\n");
        system.push_str(CONCLUDE_NOW);
    }

    let mut user = alert_block(context.alert);
    if let Some(grounding) = grounding_block(context) {
        user.push_str("\n\n");
        user.push_str(&grounding);
    }
    user.push_str("\n\nInvestigate and determine the root cause. Begin!");

    let mut messages = vec![
        json!({ "role": "system", "content": system }),
        json!({ "role": "user", "content": user }),
    ];

    for step in context.trace {
        match step.kind {
            StepKind::ToolCall => {
                let call_id = format!("call_{}", step.sequence_no);
                let thought = step.input.get("thought").and_then(Value::as_str);
                messages.push(json!({
                    "role": "assistant",
                    "content": thought,
                    "tool_calls": [{
                        "id": call_id,
                        "type": "function",
                        "function": {
                            "name": step.tool_name().unwrap_or("unknown"),
                            "arguments": tool_input(step).to_string(),
                        }
                    }]
                }));
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": observation_text(step),
                }));
            }
            StepKind::Thought => {
                if let Some(error) = step.error.as_deref() {
                    messages.push(json!({
                        "role": "user",
                        "content": format!("Your previous reply could not be used ({error}). Reply with exactly one tool call or a final answer."),
                    }));
                }
            }
            StepKind::Retrieval | StepKind::FinalAnswer => {}
        }
    }

    messages
}

pub(super) fn native_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

/// Single-prompt transcript for text-only backends using the
/// Thought / Action / Action Input / Observation / Final Answer format.
pub(super) fn react_messages(context: &OracleContext<'_>) -> Vec<Value> {
    let names: Vec<&str> = context.tools.iter().map(|t| t.name.as_str()).collect();
    let mut system = context.instructions.trim().to_string();
    system.push_str(&format!(
        "\n\nYou have access to the following tools:\n\n{}\n\nUse the following format:\n\nThought: your reasoning about what to do next\nAction: the tool to use, one of [{}]\nAction Input: the tool input as a JSON object\nObservation: the result of the action\n... (Thought/Action/Action Input/Observation can repeat)\nThought: I now know the root cause\nFinal Answer: the root cause analysis",
        tool_catalog(context.tools),
        names.join(", ")
    ));
    if context.must_conclude {
        system.push_str("\n\n");
        system.push_str(CONCLUDE_NOW);
    }

    let mut transcript = alert_block(context.alert);
    if let Some(grounding) = grounding_block(context) {
        transcript.push_str("\n\n");
        transcript.push_str(&grounding);
    }
    transcript.push_str("\n\nBegin!\n");

    for step in context.trace {
        match step.kind {
            StepKind::ToolCall => {
                if let Some(thought) = step.input.get("thought").and_then(Value::as_str) {
                    transcript.push_str(&format!("\nThought: {thought}"));
                }
                transcript.push_str(&format!(
                    "\nAction: {}\nAction Input: {}\nObservation: {}\n",
                    step.tool_name().unwrap_or("unknown"),
                    tool_input(step),
                    observation_text(step)
                ));
            }
            StepKind::Thought => {
                if let Some(error) = step.error.as_deref() {
                    transcript.push_str(&format!(
                        "\nObservation: Invalid format ({error}). Use the format above.\n"
                    ));
                }
            }
            StepKind::Retrieval | StepKind::FinalAnswer => {}
        }
    }

    vec![
        json!({ "role": "system", "content": system }),
        json!({ "role": "user", "content": transcript }),
    ]
}
