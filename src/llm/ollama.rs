//! Ollama client for local inference.

use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::PoisonError;

use crate::llm::{error::LLMError, Client, HasProvider};

/// Marker type for the Ollama provider
pub struct Ollama;

#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Server URL (default: http://localhost:11434)
    pub host: String,
    /// Default model (default: qwen2.5-coder)
    pub default_model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            default_model: "qwen2.5-coder".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
}

impl OllamaMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChatResponse {
    pub model: String,
    pub message: OllamaMessage,
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct OllamaModelsResponse {
    models: Vec<OllamaModel>,
}

/// Builder for one Ollama chat completion.
pub struct OllamaCompletionBuilder<'a, S> {
    client: &'a Client<S>,
    model: Option<String>,
    messages: Vec<OllamaMessage>,
    options: OllamaOptions,
    json_mode: bool,
}

impl<'a, S> OllamaCompletionBuilder<'a, S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(client: &'a Client<S>) -> Self {
        Self {
            client,
            model: None,
            messages: Vec::new(),
            options: OllamaOptions::default(),
            json_mode: false,
        }
    }

    /// Overrides the configured default model
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(OllamaMessage::system(content));
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(OllamaMessage::user(content));
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.num_predict = Some(max_tokens);
        self
    }

    /// Constrain the output to JSON
    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub(crate) async fn execute(self) -> Result<String, LLMError> {
        let config = self.client.ollama_config.as_ref().ok_or_else(|| {
            LLMError::ProviderNotConfigured("Ollama not configured".to_string())
        })?;
        let model = self.model.unwrap_or_else(|| config.default_model.clone());
        self.client.ensure_ollama_model(&model).await?;

        let has_options = self.options.temperature.is_some() || self.options.num_predict.is_some();
        let request = OllamaChatRequest {
            model,
            messages: self.messages,
            stream: false,
            options: has_options.then_some(self.options),
            format: self.json_mode.then(|| "json".to_string()),
        };
        let response = self.client.call_ollama_chat(&request).await?;
        if !response.done {
            log::warn!("Ollama {} returned an unfinished response", response.model);
        }
        Ok(response.message.content)
    }
}

impl<'a, S> IntoFuture for OllamaCompletionBuilder<'a, S>
where
    S: HasProvider<Ollama> + Send + Sync + Clone + 'static,
{
    type Output = Result<String, LLMError>;
    type IntoFuture = Pin<Box<dyn std::future::Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.execute())
    }
}

impl<S> Client<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub async fn ollama_list_models(&self) -> Result<Vec<OllamaModel>, LLMError> {
        let config = self.ollama_config.as_ref().ok_or_else(|| {
            LLMError::ProviderNotConfigured("Ollama not configured".to_string())
        })?;

        let response = self
            .client
            .get(format!("{}/api/tags", config.host))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LLMError::OllamaError(format!(
                "Failed to list models: HTTP {}",
                response.status()
            )));
        }
        let res: OllamaModelsResponse = response.json().await?;
        Ok(res.models)
    }

    /// Rejects a model the server does not have. The model list is fetched once; if it
    /// cannot be fetched the check is skipped and the chat call reports the problem.
    async fn ensure_ollama_model(&self, model: &str) -> Result<(), LLMError> {
        let cached = self
            .model_cache
            .ollama
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let known = match cached {
            Some(names) => Some(names),
            None => match self.ollama_list_models().await {
                Ok(models) => {
                    let names: Vec<String> = models.into_iter().map(|m| m.name).collect();
                    *self
                        .model_cache
                        .ollama
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Some(names.clone());
                    Some(names)
                }
                Err(e) => {
                    log::debug!("Could not list Ollama models: {}", e);
                    None
                }
            },
        };

        match known {
            // Ollama lists "name:tag"; a bare name means ":latest"
            Some(names)
                if !names
                    .iter()
                    .any(|n| n == model || n.strip_suffix(":latest") == Some(model)) =>
            {
                Err(LLMError::InvalidModel(format!(
                    "Model '{}' not found in Ollama available models",
                    model
                )))
            }
            _ => Ok(()),
        }
    }

    pub async fn call_ollama_chat(&self, request: &OllamaChatRequest) -> Result<OllamaChatResponse, LLMError> {
        let config = self.ollama_config.as_ref().ok_or_else(|| {
            LLMError::ProviderNotConfigured("Ollama not configured".to_string())
        })?;

        let response = self
            .client
            .post(format!("{}/api/chat", config.host))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::OllamaError(format!("HTTP {}: {}", status, error_text)));
        }

        Ok(response.json().await?)
    }

    /// Starts a chat completion against Ollama.
    pub fn ollama_complete(&self) -> OllamaCompletionBuilder<'_, S>
    where
        S: HasProvider<Ollama>,
    {
        OllamaCompletionBuilder::new(self)
    }
}
