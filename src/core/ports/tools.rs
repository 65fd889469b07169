use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::ToolInvocationError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub summary: String,
    #[serde(default)]
    pub data: Value,
}

impl Observation {
    pub fn text(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            data: Value::Null,
        }
    }
}

pub type ToolFuture<'a> = BoxFuture<'a, Result<Observation, ToolInvocationError>>;

pub trait ToolPort: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Schema check without side effects.
    fn validate(&self, name: &str, input: &Value) -> Result<(), ToolInvocationError>;

    /// Validates then invokes.
    fn invoke<'a>(&'a self, name: &'a str, input: Value) -> ToolFuture<'a>;
}
