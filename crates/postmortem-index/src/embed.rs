//! Embedding collaborator and the local fastembed-backed implementation

use async_trait::async_trait;
use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding model unavailable: {0}")]
    Unavailable(String),
    #[error("embedding model failed: {0}")]
    Model(String),
    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// `embed` bounded by `timeout`
pub async fn embed_within(
    embedder: &dyn Embedder,
    texts: Vec<String>,
    timeout: Duration,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    match tokio::time::timeout(timeout, embedder.embed(texts)).await {
        Ok(result) => result,
        Err(_) => Err(EmbedError::Timeout(timeout)),
    }
}

/// Local ONNX embedding model, loaded on first use
pub struct FastEmbedder {
    model: Arc<Mutex<Option<TextEmbedding>>>,
    cache_dir: Option<PathBuf>,
}

impl FastEmbedder {
    pub fn new() -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            cache_dir: None,
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}

impl Default for FastEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError> {
        let model = Arc::clone(&self.model);
        let cache_dir = self.cache_dir.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = model.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_none() {
                let options = match cache_dir {
                    Some(dir) => InitOptions::default().with_cache_dir(dir),
                    None => InitOptions::default(),
                };
                let loaded = TextEmbedding::try_new(options).map_err(|e| EmbedError::Unavailable(e.to_string()))?;
                tracing::info!("embedding model loaded");
                *guard = Some(loaded);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| EmbedError::Unavailable("model not loaded".to_string()))?;
            model.embed(texts, None).map_err(|e| EmbedError::Model(e.to_string()))
        })
        .await
        .map_err(|e| EmbedError::Model(e.to_string()))?
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a < 1e-8 || norm_b < 1e-8 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    #[async_trait]
    impl Embedder for Stalled {
        async fn embed(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_embed_within_times_out() {
        let result = embed_within(&Stalled, vec!["q".to_string()], Duration::from_millis(20)).await;
        assert!(matches!(result, Err(EmbedError::Timeout(_))));
    }
}
