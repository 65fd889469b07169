use thiserror::Error;

use super::model::RunStatus;

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    ToolInvocation(#[from] ToolInvocationError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("knowledge retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("illegal transition for run {run_id}: {from} -> {to}")]
    IllegalTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("job {job_id} is owned by another claim ({owner})")]
    JobRedeliveryConflict { job_id: String, owner: String },
    #[error("run {0} not found")]
    NotFound(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TriageError {
    /// Client-side errors are never retried by the worker pool.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TriageError::Validation(_) | TriageError::IllegalTransition { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("oracle transport failure: {0}")]
    Transport(String),
    #[error("oracle provider error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("oracle returned a malformed response: {0}")]
    Malformed(String),
}

impl OracleError {
    pub fn is_retriable(&self) -> bool {
        match self {
            OracleError::Timeout { .. } | OracleError::Transport(_) => true,
            OracleError::Provider { status, .. } => *status == 429 || *status >= 500,
            OracleError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolInvocationError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid input for tool {tool}: {message}")]
    InvalidInput { tool: String, message: String },
    #[error("tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },
    #[error("tool {tool} failed: {message}")]
    Failed {
        tool: String,
        message: String,
        retriable: bool,
    },
}

impl ToolInvocationError {
    pub fn failed(tool: &str, message: impl Into<String>, retriable: bool) -> Self {
        ToolInvocationError::Failed {
            tool: tool.to_string(),
            message: message.into(),
            retriable,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            ToolInvocationError::Timeout { .. } => true,
            ToolInvocationError::Failed { retriable, .. } => *retriable,
            ToolInvocationError::UnknownTool(_) | ToolInvocationError::InvalidInput { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_retry_classification_follows_status() {
        assert!(OracleError::Timeout { timeout_ms: 10 }.is_retriable());
        assert!(OracleError::Provider {
            status: 429,
            message: "rate limit".to_string()
        }
        .is_retriable());
        assert!(OracleError::Provider {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_retriable());
        assert!(!OracleError::Provider {
            status: 401,
            message: "unauthorized".to_string()
        }
        .is_retriable());
        assert!(!OracleError::Malformed("not json".to_string()).is_retriable());
    }

    #[test]
    fn schema_failures_are_not_retried() {
        let invalid = ToolInvocationError::InvalidInput {
            tool: "kubectl".to_string(),
            message: "missing command".to_string(),
        };
        assert!(!invalid.is_retriable());
        assert!(ToolInvocationError::failed("kubectl", "connection refused", true).is_retriable());
    }
}
