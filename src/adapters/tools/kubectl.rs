use std::process::Stdio;

use serde_json::{json, Value};
use tokio::process::Command;

use super::{truncate_output, ToolExecutor};
use crate::core::error::ToolInvocationError;
use crate::core::ports::tools::{Observation, ToolDefinition, ToolFuture};

const NAME: &str = "kubectl";

/// Read-only verbs the agent may run.
const ALLOWED_VERBS: &[&str] = &["get", "describe", "logs", "top", "events"];

/// Flags that would redirect kubectl at another cluster or identity.
const BLOCKED_FLAGS: &[&str] = &[
    "--kubeconfig",
    "--context",
    "--cluster",
    "--server",
    "-s",
    "--token",
    "--as",
    "--as-group",
    "--user",
];

pub struct KubectlTool {
    definition: ToolDefinition,
    binary: String,
    context: Option<String>,
    max_output_chars: usize,
}

impl KubectlTool {
    pub fn new(binary: &str, context: Option<String>, max_output_chars: usize) -> Self {
        Self {
            definition: ToolDefinition {
                name: NAME.to_string(),
                description: "Use this to inspect cluster state: runs a read-only kubectl command (get, describe, logs, top, events). Pass the arguments after 'kubectl', e.g. 'describe pod podA -n prod'. Errors: mutating verbs and flags that switch cluster or identity are refused. Edge cases: long output is truncated; narrow with -l selectors or --tail."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "minLength": 1, "description": "Arguments after 'kubectl'" }
                    },
                    "required": ["command"],
                    "additionalProperties": false
                }),
            },
            binary: binary.to_string(),
            context: context.filter(|c| !c.trim().is_empty()),
            max_output_chars: max_output_chars.max(256),
        }
    }
}

/// Splits and vets the argument string. Rejections are not retriable.
pub(super) fn parse_command(command: &str) -> Result<Vec<String>, ToolInvocationError> {
    let mut args: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if args.first().map(String::as_str) == Some("kubectl") {
        args.remove(0);
    }
    let Some(verb) = args.first() else {
        return Err(ToolInvocationError::InvalidInput {
            tool: NAME.to_string(),
            message: "command is empty".to_string(),
        });
    };
    if !ALLOWED_VERBS.contains(&verb.as_str()) {
        return Err(ToolInvocationError::InvalidInput {
            tool: NAME.to_string(),
            message: format!("verb '{verb}' is not allowed; use one of {}", ALLOWED_VERBS.join(", ")),
        });
    }
    for arg in &args {
        let flag = arg.split('=').next().unwrap_or(arg.as_str());
        if BLOCKED_FLAGS.contains(&flag) {
            return Err(ToolInvocationError::InvalidInput {
                tool: NAME.to_string(),
                message: format!("flag '{flag}' is not allowed"),
            });
        }
        if arg.contains(['|', ';', '&', '`', '$', '>', '<']) {
            return Err(ToolInvocationError::InvalidInput {
                tool: NAME.to_string(),
                message: "shell metacharacters are not allowed".to_string(),
            });
        }
    }
    Ok(args)
}

impl ToolExecutor for KubectlTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn execute<'a>(&'a self, input: Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let command = input.get("command").and_then(Value::as_str).unwrap_or_default();
            let mut args = parse_command(command)?;
            if let Some(context) = &self.context {
                args.push(format!("--context={context}"));
            }

            log::debug!("kubectl {}", args.join(" "));
            let output = Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| {
                    ToolInvocationError::failed(NAME, format!("failed to start {}: {e}", self.binary), false)
                })?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);

            if !output.status.success() {
                // API-server hiccups are worth another attempt; bad arguments are not.
                let retriable = stderr.contains("Unable to connect")
                    || stderr.contains("i/o timeout")
                    || stderr.contains("ServiceUnavailable");
                return Err(ToolInvocationError::failed(
                    NAME,
                    format!(
                        "exit code {exit_code}: {}",
                        truncate_output(stderr.trim(), self.max_output_chars)
                    ),
                    retriable,
                ));
            }

            let text = if stdout.trim().is_empty() {
                "(no output)".to_string()
            } else {
                truncate_output(stdout.trim_end(), self.max_output_chars)
            };
            Ok(Observation {
                summary: text,
                data: json!({ "args": args, "exit_code": exit_code }),
            })
        })
    }
}
