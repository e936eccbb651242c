use thiserror::Error;

use crate::core::error::SynthesisError;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Ollama error: {0}")]
    OllamaError(String),

    #[error("DeepSeek error: {0}")]
    DeepSeekError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<LLMError> for SynthesisError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::InvalidResponse(msg) => SynthesisError::Unparsable(msg),
            other => SynthesisError::Backend(other.to_string()),
        }
    }
}
