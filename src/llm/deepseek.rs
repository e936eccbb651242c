//! DeepSeek client (OpenAI-compatible chat completions).

use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::pin::Pin;

use crate::llm::{error::LLMError, Client, HasProvider};

/// Marker type for the DeepSeek provider
pub struct DeepSeek;

#[derive(Clone, Debug)]
pub struct DeepSeekConfig {
    pub api_key: String,
    /// Base URL (default: https://api.deepseek.com)
    pub base_url: String,
    /// Default model (default: deepseek-chat, which supports JSON mode)
    pub default_model: String,
}

impl Default for DeepSeekConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.deepseek.com".to_string(),
            default_model: "deepseek-chat".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeepSeekRequest {
    pub model: String,
    pub messages: Vec<DeepSeekMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<DeepSeekResponseFormat>,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct DeepSeekResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepSeekMessage {
    pub role: String,
    pub content: String,
}

impl DeepSeekMessage {
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

#[derive(Debug, Deserialize)]
pub struct DeepSeekResponse {
    pub model: String,
    pub choices: Vec<DeepSeekChoice>,
    #[serde(default)]
    pub usage: Option<DeepSeekUsage>,
}

#[derive(Debug, Deserialize)]
pub struct DeepSeekChoice {
    pub message: DeepSeekMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeepSeekUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Builder for one DeepSeek chat completion.
pub struct DeepSeekCompletionBuilder<'a, S> {
    client: &'a Client<S>,
    model: Option<String>,
    messages: Vec<DeepSeekMessage>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    json_mode: bool,
}

impl<'a, S> DeepSeekCompletionBuilder<'a, S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(client: &'a Client<S>) -> Self {
        Self {
            client,
            model: None,
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
            json_mode: false,
        }
    }

    /// Overrides the configured default model
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(DeepSeekMessage::system(content));
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(DeepSeekMessage::user(content));
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Ask for a JSON object response
    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    fn into_request(self, default_model: &str) -> DeepSeekRequest {
        DeepSeekRequest {
            model: self.model.unwrap_or_else(|| default_model.to_string()),
            messages: self.messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: self.json_mode.then(|| DeepSeekResponseFormat {
                format_type: "json_object".to_string(),
            }),
            stream: false,
        }
    }

    pub(crate) async fn execute(self) -> Result<String, LLMError> {
        let client = self.client;
        let config = client.deepseek_config.as_ref().ok_or_else(|| {
            LLMError::ProviderNotConfigured("DeepSeek not configured".to_string())
        })?;
        let request = self.into_request(&config.default_model);
        let response = client.call_deepseek(&request).await?;

        if let Some(usage) = &response.usage {
            log::debug!(
                "DeepSeek {} used {} prompt / {} completion tokens",
                response.model,
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LLMError::InvalidResponse("No choices in response".to_string()))
    }
}

impl<'a, S> IntoFuture for DeepSeekCompletionBuilder<'a, S>
where
    S: HasProvider<DeepSeek> + Send + Sync + Clone + 'static,
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
    pub async fn call_deepseek(&self, request: &DeepSeekRequest) -> Result<DeepSeekResponse, LLMError> {
        let config = self.deepseek_config.as_ref().ok_or_else(|| {
            LLMError::ProviderNotConfigured("DeepSeek not configured".to_string())
        })?;

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", config.base_url))
            .bearer_auth(&config.api_key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::DeepSeekError(format!("HTTP {}: {}", status, error_text)));
        }

        Ok(response.json().await?)
    }

    /// Starts a chat completion against DeepSeek.
    pub fn deepseek_complete(&self) -> DeepSeekCompletionBuilder<'_, S>
    where
        S: HasProvider<DeepSeek>,
    {
        DeepSeekCompletionBuilder::new(self)
    }
}
