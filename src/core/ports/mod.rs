pub mod embedder;
pub mod emitter;
pub mod ledger;
pub mod oracle;
pub mod queue;
pub mod retriever;
pub mod tools;
