use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::adapters::config::ToolSettings;
use crate::core::error::{ToolInvocationError, TriageError};
use crate::core::ports::retriever::RetrieverPort;
use crate::core::ports::tools::{ToolDefinition, ToolFuture, ToolPort};

mod kubectl;
mod prometheus;
mod runbooks;

pub use kubectl::KubectlTool;
pub use prometheus::{PodCpuUsageTool, PrometheusClient, QueryPrometheusTool};
pub use runbooks::SearchRunbooksTool;

pub trait ToolExecutor: Send + Sync {
    fn definition(&self) -> &ToolDefinition;
    /// Called only with input that already passed the definition's schema.
    fn execute<'a>(&'a self, input: Value) -> ToolFuture<'a>;
}

struct RegisteredTool {
    executor: Box<dyn ToolExecutor>,
    schema: JSONSchema,
}

/// The tool belt: a fixed set of named, schema-checked capabilities.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn with_builtin_tools(
        settings: &ToolSettings,
        retriever: Arc<dyn RetrieverPort>,
    ) -> Result<Self, TriageError> {
        let prometheus = Arc::new(PrometheusClient::new(&settings.prometheus_url)?);
        let mut registry = Self::new();
        registry.register(SearchRunbooksTool::new(retriever, settings.runbook_k))?;
        registry.register(QueryPrometheusTool::new(prometheus.clone()))?;
        registry.register(PodCpuUsageTool::new(prometheus))?;
        registry.register(KubectlTool::new(
            &settings.kubectl_binary,
            settings.kubectl_context.clone(),
            settings.max_output_chars,
        ))?;
        Ok(registry)
    }

    pub fn register<T>(&mut self, executor: T) -> Result<(), TriageError>
    where
        T: ToolExecutor + 'static,
    {
        let definition = executor.definition();
        let name = definition.name.clone();
        if self.tools.contains_key(&name) {
            return Err(TriageError::Config(format!("tool '{name}' registered twice")));
        }
        let schema = JSONSchema::compile(&definition.input_schema)
            .map_err(|e| TriageError::Config(format!("invalid schema for tool '{name}': {e}")))?;
        self.order.push(name.clone());
        self.tools.insert(
            name,
            RegisteredTool {
                executor: Box::new(executor),
                schema,
            },
        );
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    fn lookup(&self, name: &str) -> Result<&RegisteredTool, ToolInvocationError> {
        self.tools
            .get(name)
            .ok_or_else(|| ToolInvocationError::UnknownTool(name.to_string()))
    }
}

fn check_input(name: &str, tool: &RegisteredTool, input: &Value) -> Result<(), ToolInvocationError> {
    if let Err(errors) = tool.schema.validate(input) {
        let message = errors
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{path}: {err}")
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ToolInvocationError::InvalidInput {
            tool: name.to_string(),
            message,
        });
    }
    Ok(())
}

impl ToolPort for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.executor.definition().clone())
            .collect()
    }

    fn validate(&self, name: &str, input: &Value) -> Result<(), ToolInvocationError> {
        check_input(name, self.lookup(name)?, input)
    }

    fn invoke<'a>(&'a self, name: &'a str, input: Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let tool = self.lookup(name)?;
            check_input(name, tool, &input)?;
            tool.executor.execute(input).await
        })
    }
}

/// Keeps observations bounded so a chatty tool cannot blow up the transcript.
pub(crate) fn truncate_output(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n... [truncated]")
}
