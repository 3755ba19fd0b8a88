use anyhow::{Context, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Local sentence embeddings (BGE-small-en-v1.5, 384 dimensions).
///
/// The model is loaded on first use. Inference runs on the blocking pool; the
/// model is moved into the blocking task and put back afterwards.
#[derive(Clone)]
pub struct FastEmbedder {
    model: Arc<Mutex<Option<TextEmbedding>>>,
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("model", &"BGESmallENV15")
            .finish_non_exhaustive()
    }
}

impl Default for FastEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl FastEmbedder {
    pub fn new() -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut guard = self.model.lock().await;
        let loaded = guard.take();
        let texts = vec![text.to_string()];

        let (result, model) = tokio::task::spawn_blocking(move || {
            let mut model = match loaded {
                Some(model) => model,
                None => {
                    info!("Initializing fastembed model (BG-Small-En-V1.5)...");
                    match TextEmbedding::try_new(InitOptions::new(EmbeddingModel::BGESmallENV15)) {
                        Ok(model) => model,
                        Err(err) => return (Err(err), None),
                    }
                }
            };
            let result = model.embed(texts, None);
            (result, Some(model))
        })
        .await?;

        *guard = model;
        result
            .map_err(|e| anyhow::anyhow!(e))?
            .into_iter()
            .next()
            .context("embedding model returned no vectors")
    }
}
