//! LLM backends for synthesis (feature `llm`).
//!
//! [`Client`] tracks which providers are configured with a typestate, so provider
//! specific calls only compile when that provider was enabled. Any configured client
//! can serve as a [`SynthesisBackend`](crate::SynthesisBackend) through
//! [`LlmBackend`].

pub mod backend;
pub mod deepseek;
pub mod error;
pub mod ollama;

use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

pub use backend::LlmBackend;
pub use deepseek::{DeepSeek, DeepSeekConfig, DeepSeekMessage};
pub use error::LLMError;
pub use ollama::{Ollama, OllamaConfig, OllamaMessage};

/// HTTP client plus provider configuration.
#[derive(Clone)]
pub struct Client<S> {
    pub(crate) client: reqwest::Client,
    pub(crate) state: PhantomData<S>,
    pub(crate) ollama_config: Option<OllamaConfig>,
    pub(crate) deepseek_config: Option<DeepSeekConfig>,
    /// Models each provider reported, fetched once and used to reject unknown names early
    pub(crate) model_cache: ModelCache,
}

#[derive(Clone, Default)]
pub struct ModelCache {
    pub(crate) ollama: Arc<RwLock<Option<Vec<String>>>>,
}

// ============================================================================
// Type States
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Enabled;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disabled;

/// Which providers a client has, one type parameter per provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Providers<OllamaState, DeepSeekState> {
    _ollama: PhantomData<OllamaState>,
    _deepseek: PhantomData<DeepSeekState>,
}

pub trait HasProvider<Provider> {}

impl<D> HasProvider<Ollama> for Providers<Enabled, D> {}

impl<O> HasProvider<DeepSeek> for Providers<O, Enabled> {}

// ============================================================================
// Construction
// ============================================================================

impl Client<Providers<Disabled, Disabled>> {
    /// A client with no providers configured.
    pub fn new() -> Self {
        Client {
            client: reqwest::Client::new(),
            state: PhantomData,
            ollama_config: None,
            deepseek_config: None,
            model_cache: ModelCache::default(),
        }
    }

    /// Enables whichever providers the environment describes: DeepSeek when
    /// `DEEPSEEK_API_KEY` is set, Ollama at `OLLAMA_HOST` (or the default host).
    pub fn from_env() -> Client<Providers<Enabled, Enabled>> {
        let client = match std::env::var("OLLAMA_HOST") {
            Ok(host) if !host.trim().is_empty() => Self::new().with_ollama_at(host),
            _ => Self::new().with_ollama(),
        };
        let mut client = client.with_deepseek(std::env::var("DEEPSEEK_API_KEY").unwrap_or_default());
        if client.deepseek_config.as_ref().is_some_and(|c| c.api_key.is_empty()) {
            client.deepseek_config = None;
        }
        client
    }
}

impl Default for Client<Providers<Disabled, Disabled>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Client<Providers<Disabled, D>> {
    /// Enables Ollama at http://localhost:11434.
    pub fn with_ollama(self) -> Client<Providers<Enabled, D>> {
        self.with_ollama_config(OllamaConfig::default())
    }

    pub fn with_ollama_at(self, host: impl Into<String>) -> Client<Providers<Enabled, D>> {
        self.with_ollama_config(OllamaConfig {
            host: host.into(),
            ..Default::default()
        })
    }

    pub fn with_ollama_config(self, config: OllamaConfig) -> Client<Providers<Enabled, D>> {
        Client {
            client: self.client,
            state: PhantomData,
            ollama_config: Some(config),
            deepseek_config: self.deepseek_config,
            model_cache: self.model_cache,
        }
    }
}

impl<O> Client<Providers<O, Disabled>> {
    /// Enables DeepSeek at https://api.deepseek.com.
    pub fn with_deepseek(self, api_key: impl Into<String>) -> Client<Providers<O, Enabled>> {
        self.with_deepseek_config(DeepSeekConfig {
            api_key: api_key.into(),
            ..Default::default()
        })
    }

    pub fn with_deepseek_config(self, config: DeepSeekConfig) -> Client<Providers<O, Enabled>> {
        Client {
            client: self.client,
            state: PhantomData,
            ollama_config: self.ollama_config,
            deepseek_config: Some(config),
            model_cache: self.model_cache,
        }
    }
}

impl<D> Client<Providers<Enabled, D>> {
    pub fn set_ollama_model(&mut self, model: impl Into<String>) {
        if let Some(config) = self.ollama_config.as_mut() {
            config.default_model = model.into();
        }
    }
}

impl<O> Client<Providers<O, Enabled>> {
    pub fn set_deepseek_model(&mut self, model: impl Into<String>) {
        if let Some(config) = self.deepseek_config.as_mut() {
            config.default_model = model.into();
        }
    }
}

impl<S: Clone + Send + Sync + 'static> Client<S> {
    /// Sends a system and user prompt to the first configured provider, preferring the
    /// hosted one, in JSON mode.
    pub(crate) async fn dispatch_complete(
        &self,
        system: &str,
        prompt: &str,
        model: Option<String>,
        temperature: Option<f32>,
    ) -> Result<String, LLMError> {
        if self.deepseek_config.is_some() {
            let mut builder = deepseek::DeepSeekCompletionBuilder::new(self)
                .system(system)
                .user(prompt)
                .json_mode(true);
            if let Some(m) = model {
                builder = builder.model(m);
            }
            if let Some(t) = temperature {
                builder = builder.temperature(t);
            }
            return builder.execute().await;
        }

        if self.ollama_config.is_some() {
            let mut builder = ollama::OllamaCompletionBuilder::new(self)
                .system(system)
                .user(prompt)
                .json_mode(true);
            if let Some(m) = model {
                builder = builder.model(m);
            }
            if let Some(t) = temperature {
                builder = builder.temperature(t);
            }
            return builder.execute().await;
        }

        Err(LLMError::ProviderNotConfigured(
            "No LLM provider available".to_string(),
        ))
    }
}
