use serde_json::{json, Value};

use crate::core::model::Conclusion;
use crate::core::ports::oracle::Decision;
use crate::core::ports::tools::ToolDefinition;

const FINAL_ANSWER: &str = "Final Answer:";
const ACTION: &str = "Action:";
const ACTION_INPUT: &str = "Action Input:";
const THOUGHT: &str = "Thought:";

fn find_marker(text: &str, marker: &str) -> Option<usize> {
    text.find(marker)
}

fn thought_before(text: &str, end: usize) -> Option<String> {
    let head = &text[..end];
    let start = head.rfind(THOUGHT).map(|i| i + THOUGHT.len()).unwrap_or(0);
    let thought = head[start..].trim();
    (!thought.is_empty()).then(|| thought.to_string())
}

/// A final answer may be a JSON conclusion or free text.
pub(super) fn parse_conclusion(text: &str) -> Conclusion {
    let trimmed = text.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    if candidate.starts_with('{') {
        if let Ok(conclusion) = serde_json::from_str::<Conclusion>(candidate) {
            if !conclusion.is_empty() {
                return Conclusion {
                    synthesized: false,
                    ..conclusion
                };
            }
        }
    }
    Conclusion::from_text(trimmed)
}

/// Models often pass a bare string to single-argument tools.
fn coerce_input(raw: &str, tool: Option<&ToolDefinition>) -> Value {
    let raw = raw.trim().trim_matches('`').trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    let text = serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.to_string());
    let sole_required = tool
        .and_then(|t| t.input_schema.get("required"))
        .and_then(Value::as_array)
        .filter(|required| required.len() == 1)
        .and_then(|required| required[0].as_str());
    match sole_required {
        Some(field) => json!({ field: text }),
        None => json!({ "input": text }),
    }
}

pub(super) fn parse_react(text: &str, tools: &[ToolDefinition]) -> Decision {
    let final_at = find_marker(text, FINAL_ANSWER);
    let action_at = find_marker(text, ACTION).filter(|&i| !text[i..].starts_with(ACTION_INPUT));

    match (final_at, action_at) {
        (Some(_), Some(_)) => Decision::Unparsed {
            raw: text.to_string(),
            reason: "reply contains both an Action and a Final Answer".to_string(),
        },
        (Some(at), None) => {
            let answer = text[at + FINAL_ANSWER.len()..].trim();
            if answer.is_empty() {
                return Decision::Unparsed {
                    raw: text.to_string(),
                    reason: "Final Answer is empty".to_string(),
                };
            }
            Decision::FinalAnswer {
                thought: thought_before(text, at),
                conclusion: parse_conclusion(answer),
            }
        }
        (None, Some(at)) => {
            let after = &text[at + ACTION.len()..];
            let Some(input_at) = after.find(ACTION_INPUT) else {
                return Decision::Unparsed {
                    raw: text.to_string(),
                    reason: "Action without Action Input".to_string(),
                };
            };
            let tool = after[..input_at].trim().trim_matches('`').trim().to_string();
            if tool.is_empty() {
                return Decision::Unparsed {
                    raw: text.to_string(),
                    reason: "Action names no tool".to_string(),
                };
            }
            let mut raw_input = &after[input_at + ACTION_INPUT.len()..];
            if let Some(stop) = raw_input.find("\nObservation") {
                raw_input = &raw_input[..stop];
            }
            let definition = tools.iter().find(|t| t.name == tool);
            Decision::ToolCall {
                thought: thought_before(text, at),
                input: coerce_input(raw_input, definition),
                tool,
            }
        }
        (None, None) => Decision::Unparsed {
            raw: text.to_string(),
            reason: "reply has neither an Action nor a Final Answer".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "search_runbooks".to_string(),
            description: String::new(),
            input_schema: json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }),
        }]
    }

    #[test]
    fn parses_action_with_json_input() {
        let text = "Thought: check CPU first\nAction: pod_cpu_usage\nAction Input: {\"pod\": \"podA\"}\nObservation: ignored";
        match parse_react(text, &tools()) {
            Decision::ToolCall {
                thought,
                tool,
                input,
            } => {
                assert_eq!(thought.as_deref(), Some("check CPU first"));
                assert_eq!(tool, "pod_cpu_usage");
                assert_eq!(input, json!({ "pod": "podA" }));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn bare_string_input_fills_the_sole_required_field() {
        let text = "Action: search_runbooks\nAction Input: high cpu on podA";
        match parse_react(text, &tools()) {
            Decision::ToolCall { input, .. } => {
                assert_eq!(input, json!({ "query": "high cpu on podA" }))
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn parses_final_answer() {
        let text = "Thought: evidence is conclusive\nFinal Answer: podA is CPU throttled by a 500m limit.";
        match parse_react(text, &tools()) {
            Decision::FinalAnswer {
                thought,
                conclusion,
            } => {
                assert_eq!(thought.as_deref(), Some("evidence is conclusive"));
                assert_eq!(conclusion.summary, "podA is CPU throttled by a 500m limit.");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn ambiguous_or_empty_replies_are_unparsed() {
        for text in [
            "Action: kubectl\nAction Input: get pods\nFinal Answer: done",
            "I think it is the database.",
            "Final Answer:   ",
            "Action: kubectl",
        ] {
            assert!(
                matches!(parse_react(text, &tools()), Decision::Unparsed { .. }),
                "{text}"
            );
        }
    }

    #[test]
    fn json_conclusions_keep_their_structure() {
        let conclusion = parse_conclusion(
            "```json\n{\"summary\": \"CPU saturation\", \"root_cause\": \"busy loop\", \"evidence\": [\"0.98 cores\"]}\n```",
        );
        assert_eq!(conclusion.root_cause.as_deref(), Some("busy loop"));
        assert_eq!(conclusion.evidence, vec!["0.98 cores".to_string()]);
        assert_eq!(parse_conclusion("plain words").summary, "plain words");
    }
}
