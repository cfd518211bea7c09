use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionInput {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionOutput {
    pub category: String,
}
