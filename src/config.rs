use clap::Parser;
use std::path::PathBuf;

use crate::artifact::DEFAULT_MODEL_FILE;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Local path to the model artifact
    #[arg(long, env = "MODEL_PATH", default_value = DEFAULT_MODEL_FILE)]
    pub model_path: PathBuf,

    /// Model ID from Hugging Face Hub, takes precedence over --model-path
    #[arg(long, env = "MODEL_ID")]
    pub model_id: Option<String>,

    /// Model revision/branch on Hugging Face
    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub model_revision: String,

    /// Artifact file name inside the Hub repository
    #[arg(long, env = "MODEL_FILE_NAME", default_value = "newsgroups_model.json")]
    pub model_file_name: String,

    /// Run on CPU instead of GPU
    #[arg(long, env = "CPU_ONLY")]
    pub cpu_only: bool,

    /// Cache predictions by input text
    #[arg(long = "cache", env = "PREDICTION_CACHE")]
    pub cache_enabled: bool,

    /// Maximum number of cached predictions
    #[arg(long, env = "PREDICTION_CACHE_CAPACITY", default_value = "10000")]
    pub cache_capacity: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
