use futures::future::BoxFuture;

use crate::core::error::TriageError;

pub trait EmbedderPort: Send + Sync {
    /// Stable identifier stored alongside ingested chunks.
    fn id(&self) -> &str;

    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>, TriageError>>;
}
