use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::core::error::OracleError;
use crate::core::model::{Alert, Conclusion, ScoredChunk, TraceStep};
use crate::core::ports::tools::ToolDefinition;

#[derive(Debug, Clone, Copy)]
pub struct OracleContext<'a> {
    pub instructions: &'a str,
    pub alert: &'a Alert,
    pub trace: &'a [TraceStep],
    pub grounding: &'a [ScoredChunk],
    pub tools: &'a [ToolDefinition],
    /// Budget is spent: only a final answer is acceptable.
    pub must_conclude: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ToolCall {
        thought: Option<String>,
        tool: String,
        input: Value,
    },
    FinalAnswer {
        thought: Option<String>,
        conclusion: Conclusion,
    },
    /// Output the backend produced but that could not be read as either action.
    Unparsed { raw: String, reason: String },
}

pub trait OraclePort: Send + Sync {
    fn backend(&self) -> &str;

    fn reason<'a>(
        &'a self,
        context: OracleContext<'a>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Decision, OracleError>>;
}
