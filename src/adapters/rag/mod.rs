use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::adapters::vectordb::KnowledgeStore;
use crate::core::error::TriageError;
use crate::core::model::ScoredChunk;
use crate::core::ports::embedder::EmbedderPort;
use crate::core::ports::retriever::RetrieverPort;

pub struct KnowledgeRetriever {
    db_path: PathBuf,
    embedder: Arc<dyn EmbedderPort>,
}

impl KnowledgeRetriever {
    pub fn new(db_path: PathBuf, embedder: Arc<dyn EmbedderPort>) -> Self {
        Self { db_path, embedder }
    }

    async fn corpus_size(&self) -> Result<usize, TriageError> {
        let db_path = self.db_path.clone();
        // rusqlite connections are not Send across awaits
        tokio::task::spawn_blocking(move || KnowledgeStore::open(&db_path)?.chunk_count())
            .await
            .map_err(|e| TriageError::RetrievalUnavailable(e.to_string()))?
    }
}

impl RetrieverPort for KnowledgeRetriever {
    fn retrieve<'a>(
        &'a self,
        query: &'a str,
        k: usize,
    ) -> BoxFuture<'a, Result<Vec<ScoredChunk>, TriageError>> {
        Box::pin(async move {
            let unavailable = |e: TriageError| TriageError::RetrievalUnavailable(e.to_string());

            if k == 0 || query.trim().is_empty() {
                return Ok(Vec::new());
            }
            if self.corpus_size().await.map_err(unavailable)? == 0 {
                return Ok(Vec::new());
            }

            let query_embedding = self
                .embedder
                .embed(&[query.to_string()])
                .await
                .map_err(unavailable)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    TriageError::RetrievalUnavailable("embedder returned no vector".to_string())
                })?;

            let db_path = self.db_path.clone();
            tokio::task::spawn_blocking(move || {
                KnowledgeStore::open(&db_path)?.search(&query_embedding, k)
            })
            .await
            .map_err(|e| TriageError::RetrievalUnavailable(e.to_string()))?
            .map_err(unavailable)
        })
    }
}

/// Renders retrieved chunks as source-tagged context blocks.
pub fn format_grounding(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|scored| {
            let chunk = &scored.chunk;
            let source = match &chunk.heading_path {
                Some(heading) => format!("{}#{}", chunk.source_document, heading),
                None => chunk.source_document.clone(),
            };
            format!("[Source: {}]\n{}\n", source, chunk.text)
        })
        .collect::<Vec<_>>()
        .join("\n---\n\n")
}
