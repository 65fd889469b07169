pub mod config;
pub mod embeddings;
pub mod emitter;
pub mod ingest;
pub mod ledger;
pub mod llm;
pub mod markdown;
pub mod queue;
pub mod rag;
pub mod tools;
pub mod vectordb;
