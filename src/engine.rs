use crate::error::Result;
use crate::types::{PredictionInput, PredictionOutput};
use async_trait::async_trait;

#[async_trait]
pub trait Predictor {
    async fn predict(&self, input: PredictionInput) -> Result<PredictionOutput>;
}
