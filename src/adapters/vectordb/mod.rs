use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::core::error::TriageError;
use crate::core::model::{KnowledgeChunk, ScoredChunk};

pub mod math;

#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub chunk_index: usize,
    pub heading_path: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedDocument {
    pub seq: i64,
    pub path: String,
    pub hash: String,
    pub embedder: String,
    pub chunk_count: usize,
    pub indexed_at: String,
}

/// Embedded runbook corpus. Documents keep the sequence number of their first
/// ingestion, which is the tie-breaker for equal similarity scores.
pub struct KnowledgeStore {
    conn: Connection,
}

impl KnowledgeStore {
    pub fn open(path: &Path) -> Result<Self, TriageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                hash TEXT NOT NULL,
                embedder TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                indexed_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY,
                document_seq INTEGER NOT NULL REFERENCES documents(seq) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                heading_path TEXT,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                UNIQUE(document_seq, chunk_index)
            );
            ",
        )?;
        Ok(Self { conn })
    }

    /// True when the document was indexed with the same content hash and embedder.
    pub fn document_is_current(
        &self,
        path: &str,
        hash: &str,
        embedder: &str,
    ) -> Result<bool, TriageError> {
        let stored: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT hash, embedder FROM documents WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(stored.is_some_and(|(h, e)| h == hash && e == embedder))
    }

    pub fn replace_document(
        &mut self,
        path: &str,
        hash: &str,
        embedder: &str,
        chunks: &[PreparedChunk],
    ) -> Result<(), TriageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO documents (path, hash, embedder, chunk_count, indexed_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(path) DO UPDATE SET
                 hash = excluded.hash,
                 embedder = excluded.embedder,
                 chunk_count = excluded.chunk_count,
                 indexed_at = excluded.indexed_at",
            params![path, hash, embedder, chunks.len() as i64],
        )?;
        let seq: i64 = tx.query_row(
            "SELECT seq FROM documents WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM chunks WHERE document_seq = ?1", params![seq])?;

        for chunk in chunks {
            tx.execute(
                "INSERT INTO chunks (document_seq, chunk_index, heading_path, content, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    seq,
                    chunk.chunk_index as i64,
                    chunk.heading_path.as_deref(),
                    chunk.text.as_str(),
                    math::encode_embedding(&chunk.embedding),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_document(&mut self, path: &str) -> Result<bool, TriageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM chunks WHERE document_seq IN (SELECT seq FROM documents WHERE path = ?1)",
            params![path],
        )?;
        let removed = tx.execute("DELETE FROM documents WHERE path = ?1", params![path])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn list_documents(&self) -> Result<Vec<IndexedDocument>, TriageError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, path, hash, embedder, chunk_count, indexed_at
             FROM documents
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IndexedDocument {
                seq: row.get(0)?,
                path: row.get(1)?,
                hash: row.get(2)?,
                embedder: row.get(3)?,
                chunk_count: row.get::<_, i64>(4)? as usize,
                indexed_at: row.get(5)?,
            })
        })?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }

    pub fn chunk_count(&self) -> Result<usize, TriageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Exhaustive cosine scan, best first. Equal scores keep document
    /// insertion order, then chunk order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, TriageError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT c.id, d.path, d.seq, c.chunk_index, c.heading_path, c.content, c.embedding
             FROM chunks c
             JOIN documents d ON d.seq = c.document_seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Vec<u8>>(6)?,
            ))
        })?;

        let mut scored: Vec<(i64, ScoredChunk)> = Vec::new();
        for row in rows {
            let (id, path, document_seq, chunk_index, heading_path, content, blob) = row?;
            let embedding = math::decode_embedding(&blob);
            let similarity = math::cosine_similarity(query, &embedding);
            scored.push((
                document_seq,
                ScoredChunk {
                    chunk: KnowledgeChunk {
                        id,
                        source_document: path,
                        chunk_index: chunk_index as usize,
                        heading_path,
                        text: content,
                        embedding,
                    },
                    similarity,
                },
            ));
        }

        scored.sort_by(|(seq_a, a), (seq_b, b)| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(seq_a.cmp(seq_b))
                .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        });
        scored.truncate(k);
        Ok(scored.into_iter().map(|(_, chunk)| chunk).collect())
    }
}

#[cfg(test)]
mod tests;
