mod budget;
mod events;
pub mod instructions;
mod ledger;
pub mod run;
pub mod state;

use std::sync::Arc;

use crate::core::ports::{
    emitter::EmitterPort, ledger::LedgerPort, oracle::OraclePort, retriever::RetrieverPort,
    tools::ToolPort,
};
use crate::core::retry::RetryPolicy;

pub use budget::RunBudget;
pub use state::AgentPhase;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub budget: RunBudget,
    pub tool_retry: RetryPolicy,
    pub oracle_retry: RetryPolicy,
    pub instructions: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            budget: RunBudget::default(),
            tool_retry: RetryPolicy::default(),
            oracle_retry: RetryPolicy::default(),
            instructions: instructions::DEFAULT_INSTRUCTIONS.to_string(),
        }
    }
}

pub struct Agent {
    pub(crate) tools: Arc<dyn ToolPort>,
    pub(crate) oracle: Arc<dyn OraclePort>,
    pub(crate) ledger: Arc<dyn LedgerPort>,
    pub(crate) retriever: Arc<dyn RetrieverPort>,
    pub(crate) emitter: Arc<dyn EmitterPort>,
    pub(crate) config: AgentConfig,
}

impl Agent {
    pub fn new(
        tools: Arc<dyn ToolPort>,
        oracle: Arc<dyn OraclePort>,
        ledger: Arc<dyn LedgerPort>,
        retriever: Arc<dyn RetrieverPort>,
        emitter: Arc<dyn EmitterPort>,
        config: AgentConfig,
    ) -> Self {
        Self {
            tools,
            oracle,
            ledger,
            retriever,
            emitter,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests;
