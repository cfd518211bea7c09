use anyhow::Result;
use hf_hub::{Repo, RepoType, api::tokio::Api};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::ModelError;
use crate::pipeline::PipelineArtifact;

/// Artifact shipped beside the crate sources.
pub const DEFAULT_MODEL_FILE: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/models/newsgroups_model.json");

/// The serialized `[pipeline, target_names]` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact(pub PipelineArtifact, pub Vec<String>);

impl ModelArtifact {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ModelError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ModelError::Decode {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Local(PathBuf),
    Hub {
        model_id: String,
        revision: String,
        filename: String,
    },
}

impl From<&Config> for ArtifactSource {
    fn from(config: &Config) -> Self {
        match &config.model_id {
            Some(model_id) => Self::Hub {
                model_id: model_id.clone(),
                revision: config.model_revision.clone(),
                filename: config.model_file_name.clone(),
            },
            None => Self::Local(config.model_path.clone()),
        }
    }
}

impl ArtifactSource {
    /// Returns a local path to the artifact, downloading it first for Hub sources.
    ///
    /// Local paths are not checked here; a missing file surfaces from `load`.
    #[tracing::instrument]
    pub async fn fetch(self) -> Result<PathBuf> {
        match self {
            Self::Local(path) => Ok(path),
            Self::Hub {
                model_id,
                revision,
                filename,
            } => {
                let repo = Repo::with_revision(model_id, RepoType::Model, revision);
                let api = Api::new()?;
                let path = api.repo(repo).get(&filename).await?;
                tracing::info!(path = %path.display(), "Model artifact downloaded");
                Ok(path)
            }
        }
    }
}
