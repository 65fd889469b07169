pub mod cli;

use std::sync::Arc;

use crate::adapters::config::Settings;
use crate::adapters::embeddings::build_embedder;
use crate::adapters::emitter::LogEmitter;
use crate::adapters::ledger::SqliteLedger;
use crate::adapters::llm::build_oracle;
use crate::adapters::queue::SqliteJobQueue;
use crate::adapters::rag::KnowledgeRetriever;
use crate::adapters::tools::ToolRegistry;
use crate::core::agent::{Agent, AgentConfig};
use crate::core::error::TriageError;
use crate::core::ports::embedder::EmbedderPort;
use crate::core::ports::emitter::EmitterPort;
use crate::core::ports::retriever::RetrieverPort;
use crate::core::worker::WorkerPool;

/// Adapters wired from one `Settings`. Storage handles are cheap and opened
/// eagerly; network clients are only built by the commands that need them.
pub struct Services {
    pub settings: Settings,
    pub ledger: Arc<SqliteLedger>,
    pub queue: Arc<SqliteJobQueue>,
    pub emitter: Arc<dyn EmitterPort>,
}

impl Services {
    pub fn from_settings(settings: Settings) -> Result<Self, TriageError> {
        let data_dir = settings.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        log::debug!("data directory {}", data_dir.display());
        Ok(Self {
            ledger: Arc::new(SqliteLedger::new(settings.ledger_db_path())),
            queue: Arc::new(SqliteJobQueue::new(settings.queue_db_path(), settings.lease())),
            emitter: Arc::new(LogEmitter::new()),
            settings,
        })
    }

    pub fn embedder(&self) -> Result<Arc<dyn EmbedderPort>, TriageError> {
        build_embedder(&self.settings.embedding, self.settings.embedding_api_key())
    }

    pub fn retriever(&self) -> Result<Arc<dyn RetrieverPort>, TriageError> {
        Ok(Arc::new(KnowledgeRetriever::new(
            self.settings.knowledge_db_path(),
            self.embedder()?,
        )))
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            budget: self.settings.run_budget(),
            tool_retry: self.settings.tool_retry(),
            oracle_retry: self.settings.oracle_retry(),
            ..AgentConfig::default()
        }
    }

    pub fn agent(&self) -> Result<Agent, TriageError> {
        let retriever = self.retriever()?;
        let tools = ToolRegistry::with_builtin_tools(&self.settings.tools, retriever.clone())?;
        let oracle = build_oracle(&self.settings.oracle, self.settings.oracle_api_key())?;
        log::info!(
            "oracle backend {} with tools [{}]",
            oracle.backend(),
            tools.names().join(", ")
        );
        Ok(Agent::new(
            Arc::new(tools),
            oracle,
            self.ledger.clone(),
            retriever,
            self.emitter.clone(),
            self.agent_config(),
        ))
    }

    pub fn worker_pool(&self) -> Result<WorkerPool, TriageError> {
        Ok(WorkerPool::new(
            Arc::new(self.agent()?),
            self.queue.clone(),
            self.ledger.clone(),
            self.settings.worker_pool(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::config::OracleBackend;
    use crate::core::ports::queue::QueuePort;

    fn temp_settings() -> (Settings, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("triage-runtime-{}", uuid::Uuid::new_v4()));
        let mut settings = Settings::default();
        settings.storage.data_dir = Some(dir.to_string_lossy().to_string());
        settings.oracle.backend = OracleBackend::Local;
        (settings, dir)
    }

    #[test]
    fn services_create_storage_and_wire_the_agent() {
        let (mut settings, dir) = temp_settings();
        settings.agent.max_iterations = 0;
        let services = Services::from_settings(settings).expect("services");
        assert!(dir.is_dir());
        assert_eq!(services.queue.pending_count().expect("count"), 0);

        let agent = services.agent().expect("agent");
        assert_eq!(agent.config().budget.max_iterations, 1);
        assert!(services.worker_pool().is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_embedding_provider_is_a_config_error() {
        let (mut settings, dir) = temp_settings();
        settings.embedding.provider = "word2vec".to_string();
        let services = Services::from_settings(settings).expect("services");
        assert!(matches!(services.agent(), Err(TriageError::Config(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
