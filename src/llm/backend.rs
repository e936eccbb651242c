use async_trait::async_trait;

use crate::core::error::SynthesisError;
use crate::core::synthesis::{SynthesisBackend, SynthesisRequest, SYSTEM_PROMPT};
use crate::llm::Client;

/// Serves synthesis requests from an LLM [`Client`].
///
/// ```rust,no_run
/// use lambdai::llm::{Client, LlmBackend};
/// use lambdai::Engine;
/// use std::sync::Arc;
///
/// let backend = LlmBackend::new(Client::new().with_ollama()).temperature(0.2);
/// let engine = Engine::new(Arc::new(backend));
/// ```
#[derive(Clone)]
pub struct LlmBackend<S> {
    client: Client<S>,
    model: Option<String>,
    temperature: Option<f32>,
}

impl<S: Clone + Send + Sync + 'static> LlmBackend<S> {
    pub fn new(client: Client<S>) -> Self {
        Self {
            client,
            model: None,
            temperature: None,
        }
    }

    /// Overrides the provider's default model
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> SynthesisBackend for LlmBackend<S> {
    async fn generate(&self, request: &SynthesisRequest) -> Result<String, SynthesisError> {
        let prompt = request.render_prompt();
        let text = self
            .client
            .dispatch_complete(SYSTEM_PROMPT, &prompt, self.model.clone(), self.temperature)
            .await?;
        Ok(text)
    }
}
