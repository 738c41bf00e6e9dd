/// Embedding backends.
///
/// `LocalEmbedder` wraps fastembed's `TextEmbedding`, which is synchronous and CPU-bound, so
/// every call goes through `tokio::task::spawn_blocking`. all-MiniLM-L6-v2 produces 384-dim
/// vectors and takes plain text inputs (no task prefix).
use std::sync::Arc;

use crate::embed_client::EmbeddingClient;
use crate::error::CommonError;

/// Something that turns texts into vectors, one per input, in input order.
#[allow(async_fn_in_trait)]
pub trait Embedder {
    /// Model name recorded in the embeddings artifact.
    fn model(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError>;
}

pub struct LocalEmbedder {
    model: Arc<fastembed::TextEmbedding>,
}

impl LocalEmbedder {
    /// Initialize all-MiniLM-L6-v2. Downloads the model on first run.
    pub async fn new() -> Result<Self, CommonError> {
        let model = tokio::task::spawn_blocking(|| {
            let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(true);
            fastembed::TextEmbedding::try_new(options)
        })
        .await
        .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
        .map_err(|e| CommonError::Embedding(format!("model initialization failed: {e}")))?;

        Ok(Self {
            model: Arc::new(model),
        })
    }
}

impl Embedder for LocalEmbedder {
    fn model(&self) -> &str {
        "all-MiniLM-L6-v2"
    }

    fn dimension(&self) -> usize {
        384
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        let texts = texts.to_vec();
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.embed(texts, Some(8)))
            .await
            .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("embedding failed: {e}")))
    }
}

impl Embedder for EmbeddingClient {
    fn model(&self) -> &str {
        &self.config().model
    }

    fn dimension(&self) -> usize {
        self.config().dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        EmbeddingClient::embed(self, texts).await
    }
}

/// The backend selected by configuration.
pub enum EmbeddingBackend {
    Http(EmbeddingClient),
    Local(LocalEmbedder),
}

impl Embedder for EmbeddingBackend {
    fn model(&self) -> &str {
        match self {
            EmbeddingBackend::Http(client) => Embedder::model(client),
            EmbeddingBackend::Local(local) => local.model(),
        }
    }

    fn dimension(&self) -> usize {
        match self {
            EmbeddingBackend::Http(client) => Embedder::dimension(client),
            EmbeddingBackend::Local(local) => local.dimension(),
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        match self {
            EmbeddingBackend::Http(client) => client.embed(texts).await,
            EmbeddingBackend::Local(local) => local.embed(texts).await,
        }
    }
}
