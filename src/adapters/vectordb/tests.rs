use super::{KnowledgeStore, PreparedChunk};
use crate::testing::{remove_db, temp_db_path};

fn chunk(index: usize, text: &str, embedding: Vec<f32>) -> PreparedChunk {
    PreparedChunk {
        chunk_index: index,
        heading_path: Some("Runbook".to_string()),
        text: text.to_string(),
        embedding,
    }
}

#[test]
fn empty_corpus_searches_to_nothing() {
    let db_path = temp_db_path("vectordb-empty");
    let store = KnowledgeStore::open(&db_path).expect("open");
    assert_eq!(store.chunk_count().expect("count"), 0);
    assert!(store.search(&[1.0, 0.0], 3).expect("search").is_empty());
    remove_db(&db_path);
}

#[test]
fn ranking_breaks_ties_by_document_then_chunk_order() {
    let db_path = temp_db_path("vectordb-ties");
    let mut store = KnowledgeStore::open(&db_path).expect("open");

    store
        .replace_document(
            "b-first.md",
            "h1",
            "hashing-256",
            &[
                chunk(0, "b0", vec![1.0, 0.0]),
                chunk(1, "b1", vec![0.0, 1.0]),
            ],
        )
        .expect("index b");
    store
        .replace_document(
            "a-second.md",
            "h2",
            "hashing-256",
            &[chunk(0, "a0", vec![2.0, 0.0]), chunk(1, "a1", vec![1.0, 1.0])],
        )
        .expect("index a");

    let hits = store.search(&[1.0, 0.0], 10).expect("search");
    let texts: Vec<&str> = hits.iter().map(|h| h.chunk.text.as_str()).collect();
    // b0 and a0 both score 1.0; b-first.md was ingested first.
    assert_eq!(texts, vec!["b0", "a0", "a1", "b1"]);
    assert!(hits[0].similarity >= hits[2].similarity);

    let top = store.search(&[1.0, 0.0], 2).expect("search k=2");
    assert_eq!(top.len(), 2);

    remove_db(&db_path);
}

#[test]
fn reingest_replaces_chunks_and_keeps_insertion_order() {
    let db_path = temp_db_path("vectordb-replace");
    let mut store = KnowledgeStore::open(&db_path).expect("open");

    store
        .replace_document("cpu.md", "v1", "hashing-256", &[chunk(0, "old", vec![1.0, 0.0])])
        .expect("index v1");
    store
        .replace_document("mem.md", "m1", "hashing-256", &[chunk(0, "mem", vec![1.0, 0.0])])
        .expect("index mem");
    assert!(store
        .document_is_current("cpu.md", "v1", "hashing-256")
        .expect("current"));
    assert!(!store
        .document_is_current("cpu.md", "v1", "http:other")
        .expect("embedder changed"));

    store
        .replace_document(
            "cpu.md",
            "v2",
            "hashing-256",
            &[chunk(0, "new", vec![1.0, 0.0]), chunk(1, "new tail", vec![0.5, 0.5])],
        )
        .expect("index v2");

    let documents = store.list_documents().expect("list");
    assert_eq!(documents[0].path, "cpu.md");
    assert_eq!(documents[0].hash, "v2");
    assert_eq!(documents[0].chunk_count, 2);
    assert_eq!(store.chunk_count().expect("count"), 3);

    let hits = store.search(&[1.0, 0.0], 2).expect("search");
    assert_eq!(hits[0].chunk.text, "new");
    assert_eq!(hits[1].chunk.text, "mem");

    assert!(store.remove_document("cpu.md").expect("remove"));
    assert_eq!(store.chunk_count().expect("count"), 1);

    remove_db(&db_path);
}
