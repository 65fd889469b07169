use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapters::config::EmbeddingSettings;
use crate::adapters::vectordb::math::l2_normalize;
use crate::core::error::TriageError;
use crate::core::ports::embedder::EmbedderPort;

/// Offline feature-hashing embedder. Deterministic across runs and machines,
/// which makes it the default for tests and air-gapped installs.
pub struct HashingEmbedder {
    id: String,
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(8);
        Self {
            id: format!("hashing-{dimensions}"),
            dimensions,
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0_u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

impl EmbedderPort for HashingEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn embed<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, TriageError>> {
        Box::pin(async move { Ok(texts.iter().map(|t| self.embed_one(t)).collect()) })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client.
pub struct HttpEmbedder {
    id: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TriageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriageError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            id: format!("http:{model}"),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

impl EmbedderPort for HttpEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn embed<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, TriageError>> {
        Box::pin(async move {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let mut request = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .json(&EmbeddingRequest {
                    model: &self.model,
                    input: texts,
                });
            if let Some(key) = self.api_key.as_deref() {
                request = request.bearer_auth(key);
            }
            let response = request
                .send()
                .await
                .map_err(|e| TriageError::Embedding(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(TriageError::Embedding(format!(
                    "embedding API error ({status}): {body}"
                )));
            }

            let mut parsed = response
                .json::<EmbeddingResponse>()
                .await
                .map_err(|e| TriageError::Embedding(e.to_string()))?;
            if parsed.data.len() != texts.len() {
                return Err(TriageError::Embedding(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    parsed.data.len()
                )));
            }
            parsed.data.sort_by_key(|item| item.index.unwrap_or(usize::MAX));
            Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
        })
    }
}

pub fn build_embedder(
    settings: &EmbeddingSettings,
    api_key: Option<String>,
) -> Result<Arc<dyn EmbedderPort>, TriageError> {
    match settings.provider.trim().to_ascii_lowercase().as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(settings.dimensions))),
        "http" => Ok(Arc::new(HttpEmbedder::new(
            &settings.base_url,
            &settings.model,
            api_key,
            Duration::from_millis(settings.timeout_ms),
        )?)),
        other => Err(TriageError::Config(format!(
            "unsupported embedding provider: {other}"
        ))),
    }
}
