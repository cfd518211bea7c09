use thiserror::Error;

/// Errors raised while loading the model artifact or running a prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    /// `predict` was called before a successful `load`
    #[error("Model is not loaded")]
    NotLoaded,

    #[error("Failed to read model artifact {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode model artifact {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The artifact parsed but its pieces do not fit together
    #[error("Invalid model artifact: {0}")]
    InvalidArtifact(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Inference task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Predicted class {0} has no label")]
    UnknownClass(usize),
}

pub type Result<T> = std::result::Result<T, ModelError>;
