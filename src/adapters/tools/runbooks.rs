use std::sync::Arc;

use serde_json::{json, Value};

use super::ToolExecutor;
use crate::core::error::ToolInvocationError;
use crate::core::ports::retriever::RetrieverPort;
use crate::core::ports::tools::{Observation, ToolDefinition, ToolFuture};

const NAME: &str = "search_runbooks";

pub struct SearchRunbooksTool {
    definition: ToolDefinition,
    retriever: Arc<dyn RetrieverPort>,
    default_k: usize,
}

impl SearchRunbooksTool {
    pub fn new(retriever: Arc<dyn RetrieverPort>, default_k: usize) -> Self {
        Self {
            definition: ToolDefinition {
                name: NAME.to_string(),
                description: "Use this first for any alert: searches the team's runbooks and past incident notes for remediation steps and known causes. Input is a natural-language description of the symptom. Returns the most similar runbook passages with their source. Edge cases: an empty result means no runbook covers the symptom; continue with live diagnostics."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "minLength": 1, "description": "Symptom or question to look up" },
                        "k": { "type": "integer", "minimum": 1, "maximum": 10, "description": "Number of passages (default 3)" }
                    },
                    "required": ["query"],
                    "additionalProperties": false
                }),
            },
            retriever,
            default_k: default_k.max(1),
        }
    }
}

impl ToolExecutor for SearchRunbooksTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn execute<'a>(&'a self, input: Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let query = input
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let k = input
                .get("k")
                .and_then(Value::as_u64)
                .map(|k| k as usize)
                .unwrap_or(self.default_k);

            let hits = self
                .retriever
                .retrieve(&query, k)
                .await
                .map_err(|e| ToolInvocationError::failed(NAME, e.to_string(), true))?;

            if hits.is_empty() {
                return Ok(Observation {
                    summary: "No relevant documents found in the runbooks for this query."
                        .to_string(),
                    data: json!({ "passages": [] }),
                });
            }

            let summary = hits
                .iter()
                .map(|hit| hit.chunk.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n---\n\n");
            let passages: Vec<Value> = hits
                .iter()
                .map(|hit| {
                    json!({
                        "source": hit.chunk.source_document,
                        "heading": hit.chunk.heading_path,
                        "similarity": hit.similarity,
                    })
                })
                .collect();
            Ok(Observation {
                summary,
                data: json!({ "passages": passages }),
            })
        })
    }
}
