use async_trait::async_trait;
use candle_core::Device;
use std::path::PathBuf;
use std::sync::Arc;

use crate::artifact::ModelArtifact;
use crate::engine::Predictor;
use crate::error::{ModelError, Result};
use crate::pipeline::Pipeline;
use crate::types::{PredictionInput, PredictionOutput};

/// Holds the loaded pipeline and its label list.
///
/// Starts unloaded; `load` fills both halves from the artifact file.
pub struct NewsgroupsModel {
    model_file: PathBuf,
    device: Device,
    pipeline: Option<Arc<Pipeline>>,
    targets: Option<Vec<String>>,
}

impl NewsgroupsModel {
    pub fn new(model_file: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            model_file: model_file.into(),
            device,
            pipeline: None,
            targets: None,
        }
    }

    #[tracing::instrument(skip(self), fields(model_file = %self.model_file.display()))]
    pub fn load(&mut self) -> Result<()> {
        let ModelArtifact(pipeline, targets) = ModelArtifact::from_file(&self.model_file)?;
        if targets.is_empty() {
            return Err(ModelError::InvalidArtifact("label list is empty".to_string()));
        }

        let pipeline = Pipeline::from_artifact(pipeline, targets.len(), &self.device)?;

        tracing::info!(
            labels = targets.len(),
            features = pipeline.n_features(),
            "Model loaded"
        );
        self.pipeline = Some(Arc::new(pipeline));
        self.targets = Some(targets);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.pipeline.is_some() && self.targets.is_some()
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.targets.as_deref()
    }
}

#[async_trait]
impl Predictor for NewsgroupsModel {
    #[tracing::instrument(skip(self, input), fields(text_len = input.text.len()))]
    async fn predict(&self, input: PredictionInput) -> Result<PredictionOutput> {
        let (Some(pipeline), Some(targets)) = (&self.pipeline, &self.targets) else {
            return Err(ModelError::NotLoaded);
        };

        // Vectorizing and the matmul are CPU bound
        let pipeline = Arc::clone(pipeline);
        let predictions =
            tokio::task::spawn_blocking(move || pipeline.predict(&[input.text])).await??;

        let class = predictions
            .first()
            .copied()
            .ok_or_else(|| ModelError::InvalidArtifact("pipeline returned no prediction".into()))?;
        let category = targets
            .get(class)
            .cloned()
            .ok_or(ModelError::UnknownClass(class))?;

        tracing::debug!(class, category = %category, "Prediction made");
        Ok(PredictionOutput { category })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::DEFAULT_MODEL_FILE;

    fn loaded_model() -> NewsgroupsModel {
        let mut model = NewsgroupsModel::new(DEFAULT_MODEL_FILE, Device::Cpu);
        model.load().unwrap();
        model
    }

    fn input(text: &str) -> PredictionInput {
        PredictionInput {
            text: text.to_string(),
        }
    }

    fn temp_artifact(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "newsgroups-model-{}.json",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn predict_before_load_fails() {
        let model = NewsgroupsModel::new(DEFAULT_MODEL_FILE, Device::Cpu);
        assert!(!model.is_loaded());
        assert!(model.labels().is_none());

        let err = model.predict(input("computer graphics")).await.unwrap_err();
        assert!(matches!(err, ModelError::NotLoaded));
        assert_eq!(err.to_string(), "Model is not loaded");
    }

    #[tokio::test]
    async fn predicts_graphics() {
        let model = loaded_model();
        let output = model
            .predict(input("this is about computer graphics"))
            .await
            .unwrap();
        assert_eq!(output.category, "comp.graphics");
    }

    #[tokio::test]
    async fn predictions_come_from_label_list() {
        let model = loaded_model();
        let labels = model.labels().unwrap().to_vec();
        for text in [
            "my mac hardware needs a new apple drive",
            "the cipher uses a public key for encryption",
            "the church teaches about god and jesus",
            "",
            "!!! ???",
        ] {
            let output = model.predict(input(text)).await.unwrap();
            assert!(labels.contains(&output.category), "{text:?} -> {output:?}");
        }
    }

    #[tokio::test]
    async fn predictions_are_deterministic() {
        let model = loaded_model();
        let first = model.predict(input("render an image")).await.unwrap();
        let second = model.predict(input("render an image")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn load_twice_matches_load_once() {
        let once = loaded_model();
        let mut twice = loaded_model();
        twice.load().unwrap();

        assert_eq!(once.labels(), twice.labels());
        for text in ["secret key encryption", "apple mac", "graphics"] {
            assert_eq!(
                once.predict(input(text)).await.unwrap(),
                twice.predict(input(text)).await.unwrap()
            );
        }
    }

    #[test]
    fn missing_artifact_fails_to_load() {
        let mut model = NewsgroupsModel::new("/nonexistent/newsgroups_model.json", Device::Cpu);
        let err = model.load().unwrap_err();
        assert!(matches!(err, ModelError::Read { .. }));
        assert!(!model.is_loaded());
    }

    #[test]
    fn empty_label_list_fails_to_load() {
        let artifact = std::fs::read_to_string(DEFAULT_MODEL_FILE).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&artifact).unwrap();
        value[1] = serde_json::json!([]);
        let path = temp_artifact(&value.to_string());

        let mut model = NewsgroupsModel::new(&path, Device::Cpu);
        let result = model.load();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ModelError::InvalidArtifact(_))));
        assert!(!model.is_loaded());
    }

    #[test]
    fn corrupt_artifact_fails_to_load() {
        let path = temp_artifact("[1, 2");
        let mut model = NewsgroupsModel::new(&path, Device::Cpu);
        let result = model.load();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ModelError::Decode { .. })));
    }
}
