//! Text embedding over a local ONNX model.
//!
//! The model is loaded lazily on first use (the download/warm-up is slow and
//! most commands never need it) and inference runs off the async path in
//! batches.

use std::sync::Arc;
use std::sync::Mutex;

use fastembed::EmbeddingModel;
use fastembed::InitOptions;
use fastembed::TextEmbedding;
use tokio::sync::OnceCell;

use crate::store::EMBEDDING_DIM;
use crate::PinakesError;
use crate::Result;

/// Texts per inference call.
pub const EMBED_BATCH_SIZE: usize = 32;

pub struct Embedder {
    model: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl Default for Embedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<Mutex<TextEmbedding>>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                tracing::info!("loading embedding model (first use)");
                tokio::task::spawn_blocking(|| {
                    TextEmbedding::try_new(
                        InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                            .with_show_download_progress(false),
                    )
                    .map(|model| Arc::new(Mutex::new(model)))
                    .map_err(|e| PinakesError::EmbeddingError(format!("model init: {e}")))
                })
                .await
                .map_err(|e| PinakesError::EmbeddingError(format!("model init join: {e}")))?
            })
            .await?;
        Ok(Arc::clone(model))
    }

    /// Embed a batch of texts. Output vectors are 384-D and normalized;
    /// results align with the input by position.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model().await?;
        let embeddings = tokio::task::spawn_blocking(move || {
            let model = model.lock().unwrap();
            model
                .embed(texts, Some(EMBED_BATCH_SIZE))
                .map_err(|e| PinakesError::EmbeddingError(format!("inference: {e}")))
        })
        .await
        .map_err(|e| PinakesError::EmbeddingError(format!("inference join: {e}")))??;

        if let Some(first) = embeddings.first() {
            if first.len() != EMBEDDING_DIM {
                return Err(PinakesError::EmbeddingError(format!(
                    "model produced {}-D vectors, expected {EMBEDDING_DIM}",
                    first.len()
                )));
            }
        }
        Ok(embeddings)
    }
}
