use async_trait::async_trait;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::Predictor;
use crate::error::Result;
use crate::types::{PredictionInput, PredictionOutput};

/// In-memory map from input text to its prediction.
///
/// Once `capacity` entries are stored, further results are not cached until
/// the cache is cleared.
pub struct PredictionCache {
    entries: RwLock<HashMap<String, PredictionOutput>>,
    capacity: usize,
}

impl PredictionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn get(&self, text: &str) -> Option<PredictionOutput> {
        self.entries.read().await.get(text).cloned()
    }

    pub async fn insert(&self, text: String, output: PredictionOutput) {
        let mut entries = self.entries.write().await;
        if entries.len() < self.capacity || entries.contains_key(&text) {
            entries.insert(text, output);
        } else {
            tracing::trace!(capacity = self.capacity, "Prediction cache full, not caching");
        }
    }

    /// Drops every entry, returning how many there were.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

pub struct CachedPredictor<P> {
    inner: P,
    cache: Arc<PredictionCache>,
}

impl<P: Predictor> CachedPredictor<P> {
    pub fn new(inner: P, cache: Arc<PredictionCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<P: Predictor + Send + Sync> Predictor for CachedPredictor<P> {
    #[tracing::instrument(skip(self, input), fields(text_len = input.text.len()))]
    async fn predict(&self, input: PredictionInput) -> Result<PredictionOutput> {
        if let Some(output) = self.cache.get(&input.text).await {
            counter!("prediction_cache_hits_total").increment(1);
            tracing::debug!("Prediction served from cache");
            return Ok(output);
        }
        counter!("prediction_cache_misses_total").increment(1);

        let text = input.text.clone();
        let output = self.inner.predict(input).await?;
        self.cache.insert(text, output.clone()).await;
        let cached = self.cache.len().await;
        tracing::trace!(cached, "Prediction cached");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Labels text by its length and counts how often it is called.
    #[derive(Default)]
    struct CountingPredictor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Predictor for CountingPredictor {
        async fn predict(&self, input: PredictionInput) -> Result<PredictionOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if input.text == "fail" {
                return Err(ModelError::NotLoaded);
            }
            Ok(PredictionOutput {
                category: format!("len-{}", input.text.len()),
            })
        }
    }

    fn input(text: &str) -> PredictionInput {
        PredictionInput {
            text: text.to_string(),
        }
    }

    fn cached(capacity: usize) -> (CachedPredictor<CountingPredictor>, Arc<PredictionCache>) {
        let cache = Arc::new(PredictionCache::new(capacity));
        (
            CachedPredictor::new(CountingPredictor::default(), Arc::clone(&cache)),
            cache,
        )
    }

    #[tokio::test]
    async fn repeated_text_hits_cache() {
        let (predictor, cache) = cached(8);
        let first = predictor.predict(input("graphics")).await.unwrap();
        let second = predictor.predict(input("graphics")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(predictor.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn clear_forces_recompute() {
        let (predictor, cache) = cached(8);
        predictor.predict(input("graphics")).await.unwrap();
        predictor.predict(input("crypto")).await.unwrap();

        assert_eq!(cache.clear().await, 2);
        assert_eq!(cache.len().await, 0);

        predictor.predict(input("graphics")).await.unwrap();
        assert_eq!(predictor.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let (predictor, cache) = cached(8);
        assert!(predictor.predict(input("fail")).await.is_err());
        assert!(predictor.predict(input("fail")).await.is_err());

        assert_eq!(predictor.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn full_cache_stops_inserting() {
        let (predictor, cache) = cached(2);
        for text in ["a", "bb", "ccc"] {
            predictor.predict(input(text)).await.unwrap();
        }
        assert_eq!(cache.len().await, 2);
        assert!(cache.get("ccc").await.is_none());

        // Still answered, just not remembered
        predictor.predict(input("ccc")).await.unwrap();
        assert_eq!(predictor.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn concurrent_predictions_share_cache() {
        let (predictor, cache) = cached(8);
        let predictor = Arc::new(predictor);
        let futures = (0..16).map(|i| {
            let predictor = Arc::clone(&predictor);
            async move { predictor.predict(input(if i % 2 == 0 { "even" } else { "odd" })).await }
        });

        let results = futures::future::join_all(futures).await;
        assert!(results.iter().all(|result| result.is_ok()));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn predictions_run_on_spawned_tasks() {
        let (predictor, cache) = cached(8);
        let predictor: Arc<dyn Predictor + Send + Sync> = Arc::new(predictor);

        let handles: Vec<_> = ["graphics", "crypto", "graphics"]
            .into_iter()
            .map(|text| {
                let predictor = Arc::clone(&predictor);
                tokio::spawn(async move { predictor.predict(input(text)).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(cache.len().await, 2);
    }
}
