use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{NormalizedString, OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer};

use crate::error::{ModelError, Result};

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if metal_is_available() {
        tracing::info!("Using metal acceleration");
        Ok(Device::new_metal(0)?)
    } else if cuda_is_available() {
        tracing::info!("Using CUDA GPU acceleration");
        Ok(Device::new_cuda(0)?)
    } else {
        tracing::info!(
            "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
        );
        Ok(Device::Cpu)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    L1,
    L2,
}

fn default_lowercase() -> bool {
    true
}

fn default_ngram_range() -> (usize, usize) {
    (1, 1)
}

fn default_norm() -> Option<Norm> {
    Some(Norm::L2)
}

/// Term-frequency / inverse-document-frequency vectorizer with a fixed vocabulary.
///
/// Tokens are maximal runs of word characters at least two characters long,
/// lowercased first unless `lowercase` is off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    pub vocabulary: HashMap<String, usize>,
    /// Absent when the vectorizer was fitted without idf weighting
    #[serde(default)]
    pub idf: Option<Vec<f64>>,
    #[serde(default = "default_lowercase")]
    pub lowercase: bool,
    #[serde(default = "default_ngram_range")]
    pub ngram_range: (usize, usize),
    #[serde(default)]
    pub sublinear_tf: bool,
    #[serde(default = "default_norm")]
    pub norm: Option<Norm>,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

impl TfidfVectorizer {
    pub fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let mut normalized = NormalizedString::from(text);
        if self.lowercase {
            normalized.lowercase();
        }

        // Splits into runs of word characters and runs of punctuation
        let mut pretokenized = PreTokenizedString::from(normalized);
        Whitespace::default()
            .pre_tokenize(&mut pretokenized)
            .map_err(|e| ModelError::Tokenization(e.to_string()))?;

        Ok(pretokenized
            .get_splits(OffsetReferential::Normalized, OffsetType::Byte)
            .into_iter()
            .map(|(token, _, _)| token)
            .filter(|token| {
                token.chars().next().is_some_and(is_word_char) && token.chars().count() >= 2
            })
            .map(str::to_owned)
            .collect())
    }

    pub fn word_ngrams(&self, tokens: Vec<String>) -> Vec<String> {
        let (min_n, max_n) = self.ngram_range;
        if min_n == 1 && max_n == 1 {
            return tokens;
        }

        let mut ngrams = Vec::new();
        for n in min_n..=max_n.min(tokens.len()) {
            ngrams.extend(tokens.windows(n).map(|window| window.join(" ")));
        }
        ngrams
    }

    pub fn transform(&self, text: &str, n_features: usize) -> Result<Vec<f64>> {
        let mut row = vec![0f64; n_features];
        for term in self.word_ngrams(self.tokenize(text)?) {
            if let Some(&index) = self.vocabulary.get(&term) {
                row[index] += 1.0;
            }
        }

        if self.sublinear_tf {
            for value in row.iter_mut().filter(|value| **value > 0.0) {
                *value = 1.0 + value.ln();
            }
        }

        if let Some(idf) = &self.idf {
            for (value, weight) in row.iter_mut().zip(idf) {
                *value *= weight;
            }
        }

        let norm = match self.norm {
            Some(Norm::L2) => row.iter().map(|value| value * value).sum::<f64>().sqrt(),
            Some(Norm::L1) => row.iter().map(|value| value.abs()).sum::<f64>(),
            None => 0.0,
        };
        if norm > 0.0 {
            for value in row.iter_mut() {
                *value /= norm;
            }
        }

        Ok(row)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultinomialNbArtifact {
    pub class_log_prior: Vec<f64>,
    pub feature_log_prob: Vec<Vec<f64>>,
    /// Class value of each row, used as an index into the label list
    pub classes: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineArtifact {
    pub vectorizer: TfidfVectorizer,
    pub classifier: MultinomialNbArtifact,
}

struct MultinomialNb {
    /// (1, n_classes)
    class_log_prior: Tensor,
    /// (n_features, n_classes)
    feature_log_prob_t: Tensor,
    classes: Vec<usize>,
}

pub struct Pipeline {
    vectorizer: TfidfVectorizer,
    classifier: MultinomialNb,
    n_features: usize,
    device: Device,
}

/// Double precision everywhere except Metal, which has no f64 kernels.
fn compute_dtype(device: &Device) -> DType {
    if device.is_metal() {
        DType::F32
    } else {
        DType::F64
    }
}

/// Builds the tensor on the CPU in f64, then casts and moves it.
fn tensor_on(data: Vec<f64>, shape: (usize, usize), device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_dtype(compute_dtype(device))?
        .to_device(device)?)
}

fn invalid(message: impl Into<String>) -> ModelError {
    ModelError::InvalidArtifact(message.into())
}

impl Pipeline {
    /// Checks the artifact shapes against each other and against the number
    /// of labels, then moves the classifier weights onto `device`.
    #[tracing::instrument(skip(artifact, device), fields(vocabulary = artifact.vectorizer.vocabulary.len()))]
    pub fn from_artifact(artifact: PipelineArtifact, n_targets: usize, device: &Device) -> Result<Self> {
        let PipelineArtifact {
            vectorizer,
            classifier,
        } = artifact;

        let n_classes = classifier.class_log_prior.len();
        if n_classes == 0 {
            return Err(invalid("classifier has no classes"));
        }
        if classifier.feature_log_prob.len() != n_classes || classifier.classes.len() != n_classes {
            return Err(invalid(format!(
                "classifier has {} priors, {} feature rows and {} classes",
                n_classes,
                classifier.feature_log_prob.len(),
                classifier.classes.len()
            )));
        }

        let n_features = classifier.feature_log_prob[0].len();
        if n_features == 0 {
            return Err(invalid("classifier has no features"));
        }
        if let Some(row) = classifier
            .feature_log_prob
            .iter()
            .position(|row| row.len() != n_features)
        {
            return Err(invalid(format!(
                "feature row {row} does not have {n_features} columns"
            )));
        }

        if let Some(idf) = &vectorizer.idf {
            if idf.len() != n_features {
                return Err(invalid(format!(
                    "idf has {} entries, expected {n_features}",
                    idf.len()
                )));
            }
        }
        if let Some((term, index)) = vectorizer
            .vocabulary
            .iter()
            .find(|(_, index)| **index >= n_features)
        {
            return Err(invalid(format!(
                "term {term:?} maps to feature {index}, only {n_features} features"
            )));
        }

        let (min_n, max_n) = vectorizer.ngram_range;
        if min_n == 0 || min_n > max_n {
            return Err(invalid(format!("bad ngram range ({min_n}, {max_n})")));
        }

        if let Some(class) = classifier.classes.iter().find(|&&class| class >= n_targets) {
            return Err(invalid(format!(
                "class {class} has no label, only {n_targets} labels"
            )));
        }

        let weights: Vec<f64> = classifier.feature_log_prob.into_iter().flatten().collect();
        let feature_log_prob_t = tensor_on(weights, (n_classes, n_features), device)?
            .t()?
            .contiguous()?;
        let class_log_prior = tensor_on(classifier.class_log_prior, (1, n_classes), device)?;

        tracing::debug!(n_classes, n_features, dtype = ?compute_dtype(device), "Pipeline built");

        Ok(Self {
            vectorizer,
            classifier: MultinomialNb {
                class_log_prior,
                feature_log_prob_t,
                classes: classifier.classes,
            },
            n_features,
            device: device.clone(),
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Returns the predicted class value for each text, in order.
    pub fn predict(&self, texts: &[String]) -> Result<Vec<usize>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut features = Vec::with_capacity(texts.len() * self.n_features);
        for text in texts {
            features.extend(self.vectorizer.transform(text, self.n_features)?);
        }
        let features = tensor_on(features, (texts.len(), self.n_features), &self.device)?;

        let joint_log_likelihood = features
            .matmul(&self.classifier.feature_log_prob_t)?
            .broadcast_add(&self.classifier.class_log_prior)?;
        let predictions = joint_log_likelihood.argmax(1)?.to_vec1::<u32>()?;

        Ok(predictions
            .into_iter()
            .map(|row| self.classifier.classes[row as usize])
            .collect())
    }
}
