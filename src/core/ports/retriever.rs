use futures::future::BoxFuture;

use crate::core::error::TriageError;
use crate::core::model::ScoredChunk;

pub trait RetrieverPort: Send + Sync {
    /// Ranked by descending similarity. An empty corpus yields an empty list;
    /// failures surface as `TriageError::RetrievalUnavailable`.
    fn retrieve<'a>(
        &'a self,
        query: &'a str,
        k: usize,
    ) -> BoxFuture<'a, Result<Vec<ScoredChunk>, TriageError>>;
}
