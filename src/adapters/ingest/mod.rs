use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::adapters::markdown::{chunk_markdown, ChunkingOptions};
use crate::adapters::vectordb::{KnowledgeStore, PreparedChunk};
use crate::core::error::TriageError;
use crate::core::ports::embedder::EmbedderPort;

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub chunking: ChunkingOptions,
    pub batch_size: usize,
    /// Drop indexed documents that no longer exist under the directory.
    pub prune_missing: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingOptions::default(),
            batch_size: 32,
            prune_missing: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub chunks: usize,
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Documents are stored under their path relative to `dir`, visited in
/// sorted order so first-ingestion order is reproducible.
pub async fn ingest_directory(
    store_path: &Path,
    dir: &Path,
    embedder: &dyn EmbedderPort,
    options: IngestOptions,
) -> Result<IngestReport, TriageError> {
    if !dir.is_dir() {
        return Err(TriageError::Validation(format!(
            "runbook directory not found: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| TriageError::Io(std::io::Error::other(e.to_string())))?;
        let is_markdown = entry
            .path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
        if entry.file_type().is_file() && is_markdown {
            files.push(entry.into_path());
        }
    }

    let mut report = IngestReport {
        scanned: files.len(),
        ..IngestReport::default()
    };
    let mut seen = HashSet::new();
    let batch_size = options.batch_size.max(1);

    for file in files {
        let relative = file
            .strip_prefix(dir)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        seen.insert(relative.clone());

        let content = tokio::fs::read_to_string(&file).await?;
        let hash = content_hash(&content);
        if KnowledgeStore::open(store_path)?.document_is_current(&relative, &hash, embedder.id())? {
            log::debug!("unchanged: {relative}");
            report.unchanged += 1;
            continue;
        }

        let chunks = chunk_markdown(&content, options.chunking);
        let mut prepared = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch
                .iter()
                .map(|chunk| match &chunk.heading_path {
                    Some(heading) => format!("{heading}\n{}", chunk.text),
                    None => chunk.text.clone(),
                })
                .collect();
            let embeddings = embedder.embed(&texts).await?;
            if embeddings.len() != batch.len() {
                return Err(TriageError::Embedding(format!(
                    "embedder returned {} vectors for {} chunks",
                    embeddings.len(),
                    batch.len()
                )));
            }
            for (chunk, embedding) in batch.iter().zip(embeddings) {
                prepared.push(PreparedChunk {
                    chunk_index: prepared.len(),
                    heading_path: chunk.heading_path.clone(),
                    text: chunk.text.clone(),
                    embedding,
                });
            }
        }

        KnowledgeStore::open(store_path)?.replace_document(
            &relative,
            &hash,
            embedder.id(),
            &prepared,
        )?;
        log::info!("indexed {relative} ({} chunks)", prepared.len());
        report.indexed += 1;
        report.chunks += prepared.len();
    }

    if options.prune_missing {
        let mut store = KnowledgeStore::open(store_path)?;
        for document in store.list_documents()? {
            if !seen.contains(&document.path) && store.remove_document(&document.path)? {
                log::info!("removed {}", document.path);
                report.removed += 1;
            }
        }
    }

    Ok(report)
}
