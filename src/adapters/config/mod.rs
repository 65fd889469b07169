use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::ingest::IngestOptions;
use crate::adapters::markdown::ChunkingOptions;
use crate::core::agent::RunBudget;
use crate::core::error::TriageError;
use crate::core::retry::RetryPolicy;
use crate::core::worker::WorkerPoolConfig;

/// Bump when adding fields with non-trivial defaults.
const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub config_version: u32,
    pub storage: StorageSettings,
    pub agent: RunBudget,
    pub retry: RetrySettings,
    pub oracle: OracleSettings,
    pub embedding: EmbeddingSettings,
    pub tools: ToolSettings,
    pub workers: WorkerSettings,
    pub ingest: IngestSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding `ledger.db`, `queue.db` and `knowledge.db`. Defaults to the config directory.
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub tool: RetryPolicy,
    pub oracle: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OracleBackend {
    #[default]
    Hosted,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointSettings {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key, if any.
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4.1".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            temperature: 0.0,
            max_tokens: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleSettings {
    pub backend: OracleBackend,
    pub hosted: EndpointSettings,
    pub local: EndpointSettings,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            backend: OracleBackend::Hosted,
            hosted: EndpointSettings::default(),
            local: EndpointSettings {
                base_url: "http://localhost:8000/v1".to_string(),
                model: "sre-agent-finetuned".to_string(),
                api_key_env: None,
                temperature: 0.0,
                max_tokens: 1_024,
            },
        }
    }
}

impl OracleSettings {
    pub fn active_endpoint(&self) -> &EndpointSettings {
        match self.backend {
            OracleBackend::Hosted => &self.hosted,
            OracleBackend::Local => &self.local,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// `hashing` or `http`.
    pub provider: String,
    pub dimensions: usize,
    pub base_url: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            dimensions: 384,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolSettings {
    pub prometheus_url: String,
    pub kubectl_binary: String,
    pub kubectl_context: Option<String>,
    pub runbook_k: usize,
    pub max_output_chars: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            prometheus_url: "http://localhost:9090".to_string(),
            kubectl_binary: "kubectl".to_string(),
            kubectl_context: None,
            runbook_k: 3,
            max_output_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub poll_interval_ms: u64,
    pub lease_ms: u64,
    pub max_delivery_attempts: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            poll_interval_ms: 1_000,
            lease_ms: 600_000,
            max_delivery_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestSettings {
    pub runbooks_dir: String,
    pub window_words: usize,
    pub overlap_words: usize,
    pub batch_size: usize,
    pub prune_missing: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        let chunking = ChunkingOptions::default();
        Self {
            runbooks_dir: "runbooks".to_string(),
            window_words: chunking.window_words,
            overlap_words: chunking.overlap_words,
            batch_size: 32,
            prune_missing: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_version: 0,
            storage: StorageSettings::default(),
            agent: RunBudget::default(),
            retry: RetrySettings::default(),
            oracle: OracleSettings::default(),
            embedding: EmbeddingSettings::default(),
            tools: ToolSettings::default(),
            workers: WorkerSettings::default(),
            ingest: IngestSettings::default(),
        }
    }
}

impl Settings {
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".triage")
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, TriageError> {
        if !path.exists() {
            return Ok(Self {
                config_version: CURRENT_CONFIG_VERSION,
                ..Self::default()
            });
        }
        let content = std::fs::read_to_string(path)?;
        let mut settings: Self = toml::from_str(&content)
            .map_err(|e| TriageError::Config(format!("failed to parse {}: {e}", path.display())))?;
        if settings.config_version < CURRENT_CONFIG_VERSION {
            log::info!(
                "{} predates v{CURRENT_CONFIG_VERSION}; missing keys use defaults",
                path.display()
            );
            settings.config_version = CURRENT_CONFIG_VERSION;
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), TriageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TriageError::Config(format!("failed to serialize settings: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.storage.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => Self::config_dir(),
        }
    }

    pub fn ledger_db_path(&self) -> PathBuf {
        self.data_dir().join("ledger.db")
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir().join("queue.db")
    }

    pub fn knowledge_db_path(&self) -> PathBuf {
        self.data_dir().join("knowledge.db")
    }

    pub fn run_budget(&self) -> RunBudget {
        RunBudget {
            max_iterations: self.agent.max_iterations.clamp(1, 100),
            retrieval_k: self.agent.retrieval_k.clamp(1, 20),
            ..self.agent.clone()
        }
    }

    pub fn tool_retry(&self) -> RetryPolicy {
        clamp_retry(self.retry.tool)
    }

    pub fn oracle_retry(&self) -> RetryPolicy {
        clamp_retry(self.retry.oracle)
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            pool_size: self.workers.pool_size.clamp(1, 64),
            poll_interval: Duration::from_millis(self.workers.poll_interval_ms.max(10)),
            max_delivery_attempts: self.workers.max_delivery_attempts.max(1),
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.workers.lease_ms.max(1_000))
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            chunking: ChunkingOptions {
                window_words: self.ingest.window_words.max(16),
                overlap_words: self
                    .ingest
                    .overlap_words
                    .min(self.ingest.window_words.max(16) / 2),
            },
            batch_size: self.ingest.batch_size.clamp(1, 256),
            prune_missing: self.ingest.prune_missing,
        }
    }

    pub fn oracle_api_key(&self) -> Option<String> {
        resolve_secret(self.oracle.active_endpoint().api_key_env.as_deref())
    }

    pub fn embedding_api_key(&self) -> Option<String> {
        resolve_secret(self.embedding.api_key_env.as_deref())
    }
}

fn clamp_retry(policy: RetryPolicy) -> RetryPolicy {
    RetryPolicy {
        max_attempts: policy.max_attempts.clamp(1, 10),
        ..policy
    }
}

fn resolve_secret(env_name: Option<&str>) -> Option<String> {
    let name = env_name.map(str::trim).filter(|n| !n.is_empty())?;
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("triage-config-test-{}", uuid::Uuid::new_v4()))
            .join("config.toml")
    }

    #[test]
    fn missing_file_returns_current_defaults() {
        let settings = Settings::load(&temp_config_path()).expect("load");
        assert_eq!(settings.config_version, CURRENT_CONFIG_VERSION);
        assert_eq!(settings.agent.max_iterations, 12);
        assert_eq!(settings.oracle.backend, OracleBackend::Hosted);
        assert_eq!(settings.retry.tool.max_attempts, 3);
    }

    #[test]
    fn partial_file_keeps_defaults_and_ignores_unknown_keys() {
        let settings: Settings = toml::from_str(
            r#"
unknown_top_level = true

[agent]
max_iterations = 8

[oracle]
backend = "local"

[retry.tool]
max_attempts = 5
"#,
        )
        .expect("parse partial config");
        assert_eq!(settings.config_version, 0);
        assert_eq!(settings.agent.max_iterations, 8);
        assert_eq!(settings.agent.retrieval_k, 3);
        assert_eq!(settings.oracle.backend, OracleBackend::Local);
        assert_eq!(settings.oracle.active_endpoint().model, "sre-agent-finetuned");
        assert_eq!(settings.retry.tool.max_attempts, 5);
        assert_eq!(settings.retry.tool.initial_backoff_ms, 200);
        assert_eq!(settings.retry.oracle.max_attempts, 3);
    }

    #[test]
    fn accessors_clamp_nonsense() {
        let mut settings = Settings::default();
        settings.agent.max_iterations = 0;
        settings.workers.pool_size = 0;
        settings.retry.oracle.max_attempts = 0;
        settings.ingest.window_words = 4;
        settings.ingest.overlap_words = 400;
        assert_eq!(settings.run_budget().max_iterations, 1);
        assert_eq!(settings.worker_pool().pool_size, 1);
        assert_eq!(settings.oracle_retry().max_attempts, 1);
        let ingest = settings.ingest_options();
        assert_eq!(ingest.chunking.window_words, 16);
        assert_eq!(ingest.chunking.overlap_words, 8);
    }

    #[test]
    fn worker_defaults_match_the_pool_defaults() {
        let from_settings = Settings::default().worker_pool();
        let pool_default = WorkerPoolConfig::default();
        assert_eq!(from_settings.max_delivery_attempts, 3);
        assert_eq!(pool_default.max_delivery_attempts, from_settings.max_delivery_attempts);
        assert_eq!(pool_default.pool_size, from_settings.pool_size);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        std::fs::write(&path, "[agent\nmax_iterations = ").expect("write");
        assert!(matches!(Settings::load(&path), Err(TriageError::Config(_))));
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn save_and_reload_round_trips() {
        let path = temp_config_path();
        let mut settings = Settings::default();
        settings.storage.data_dir = Some("/var/lib/triage".to_string());
        settings.tools.kubectl_context = Some("prod".to_string());
        settings.save(&path).expect("save");

        let reloaded = Settings::load(&path).expect("reload");
        assert_eq!(reloaded.ledger_db_path(), PathBuf::from("/var/lib/triage/ledger.db"));
        assert_eq!(reloaded.tools.kubectl_context.as_deref(), Some("prod"));
        assert_eq!(reloaded.config_version, CURRENT_CONFIG_VERSION);

        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn secrets_resolve_from_named_env_var() {
        let name = format!("TRIAGE_TEST_KEY_{}", uuid::Uuid::new_v4().simple());
        assert_eq!(resolve_secret(Some(&name)), None);
        std::env::set_var(&name, " sk-test ");
        assert_eq!(resolve_secret(Some(&name)).as_deref(), Some("sk-test"));
        std::env::remove_var(&name);
        assert_eq!(resolve_secret(None), None);
    }
}
