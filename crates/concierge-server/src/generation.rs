use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concierge_config::{Generation, GenerationProviderKind};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;

/// A language-model backend that turns a system prompt and one user message into a
/// reply.
///
/// Implementations must return promptly once `cancel` fires, whatever their own
/// transport timeout is.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn generate_response(
        &self,
        cancel: &CancellationToken,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, GenerationError>;
}

/// Run one generation under a hard deadline. The child token is cancelled when the
/// deadline passes, and also when `parent` is cancelled.
pub async fn generate_with_deadline(
    provider: &dyn GenerationProvider,
    parent: &CancellationToken,
    deadline: Duration,
    system_prompt: &str,
    user_message: &str,
) -> Result<String, GenerationError> {
    let cancel = parent.child_token();
    let outcome = tokio::time::timeout(
        deadline,
        provider.generate_response(&cancel, system_prompt, user_message),
    )
    .await;
    match outcome {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(GenerationError::Timeout)
        }
    }
}

/// Built-in defaults of one provider, before config overrides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderDefaults {
    pub base_url: &'static str,
    pub model: &'static str,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

pub fn provider_defaults(kind: GenerationProviderKind) -> ProviderDefaults {
    let (base_url, model, timeout_ms) = match kind {
        GenerationProviderKind::Openai => ("https://api.openai.com/v1", "gpt-4o-mini", 30_000),
        GenerationProviderKind::Deepseek => {
            ("https://api.deepseek.com/v1", "deepseek-chat", 30_000)
        }
        GenerationProviderKind::Groq => (
            "https://api.groq.com/openai/v1",
            "llama-3.1-8b-instant",
            30_000,
        ),
        GenerationProviderKind::Openrouter => {
            ("https://openrouter.ai/api/v1", "openai/gpt-4o-mini", 60_000)
        }
        GenerationProviderKind::Together => (
            "https://api.together.xyz/v1",
            "meta-llama/Llama-3.3-70B-Instruct-Turbo",
            60_000,
        ),
        GenerationProviderKind::Ollama => ("http://localhost:11434/v1", "llama3.2", 120_000),
        GenerationProviderKind::Anthropic => {
            ("https://api.anthropic.com/v1", "claude-3-5-haiku-latest", 60_000)
        }
        GenerationProviderKind::Gemini => (
            "https://generativelanguage.googleapis.com/v1beta",
            "gemini-1.5-flash",
            60_000,
        ),
    };
    ProviderDefaults {
        base_url,
        model,
        temperature: 0.7,
        max_tokens: 500,
        timeout_ms,
    }
}

pub fn provider_label(kind: GenerationProviderKind) -> &'static str {
    match kind {
        GenerationProviderKind::Openai => "openai",
        GenerationProviderKind::Deepseek => "deepseek",
        GenerationProviderKind::Groq => "groq",
        GenerationProviderKind::Openrouter => "openrouter",
        GenerationProviderKind::Together => "together",
        GenerationProviderKind::Ollama => "ollama",
        GenerationProviderKind::Anthropic => "anthropic",
        GenerationProviderKind::Gemini => "gemini",
    }
}

/// Effective settings of a provider: defaults with config overrides applied.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub api_key: Option<String>,
}

impl ProviderSettings {
    pub fn resolve(cfg: &Generation, api_key: Option<String>) -> Self {
        let defaults = provider_defaults(cfg.provider);
        Self {
            base_url: cfg
                .base_url
                .as_deref()
                .unwrap_or(defaults.base_url)
                .trim_end_matches('/')
                .to_string(),
            model: cfg.model.clone().unwrap_or_else(|| defaults.model.to_string()),
            temperature: cfg.temperature.unwrap_or(defaults.temperature),
            max_tokens: cfg.max_tokens.unwrap_or(defaults.max_tokens),
            timeout: Duration::from_millis(cfg.timeout_ms.unwrap_or(defaults.timeout_ms)),
            api_key,
        }
    }
}

/// Build the configured provider, reading its key from `generation.api_key_env`.
pub fn build_generation_provider(
    cfg: &Generation,
) -> Result<Arc<dyn GenerationProvider>, GenerationError> {
    let api_key = match cfg.api_key_env.as_deref() {
        Some(var) => Some(std::env::var(var).map_err(|_| {
            GenerationError::Config(format!("environment variable {var} is not set"))
        })?),
        None => None,
    };
    build_generation_provider_with_key(cfg, api_key)
}

pub fn build_generation_provider_with_key(
    cfg: &Generation,
    api_key: Option<String>,
) -> Result<Arc<dyn GenerationProvider>, GenerationError> {
    let name = provider_label(cfg.provider);
    if api_key.is_none() && cfg.provider != GenerationProviderKind::Ollama {
        return Err(GenerationError::Config(format!(
            "provider {name} needs generation.api_key_env"
        )));
    }
    let settings = ProviderSettings::resolve(cfg, api_key);
    Ok(match cfg.provider {
        GenerationProviderKind::Anthropic => Arc::new(AnthropicProvider::new(settings)?),
        GenerationProviderKind::Gemini => Arc::new(GeminiProvider::new(settings)?),
        _ => Arc::new(OpenAiCompatibleProvider::new(name, settings)?),
    })
}

fn http_client(timeout: Duration) -> Result<Client, GenerationError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| GenerationError::Config(e.to_string()))
}

/// Send `request` and decode the JSON body, giving up as soon as `cancel` fires.
/// Dropping the in-flight future aborts the underlying connection.
async fn post_json<T: for<'de> Deserialize<'de>>(
    cancel: &CancellationToken,
    request: RequestBuilder,
) -> Result<T, GenerationError> {
    let call = async {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Transport(format!("request timed out: {e}"))
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| GenerationError::Decode(e.to_string()))
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GenerationError::Cancelled),
        result = call => result,
    }
}

fn non_empty(text: String) -> Result<String, GenerationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(trimmed.to_string())
}

/// Chat-completions wire shape shared by OpenAI, DeepSeek, Groq, OpenRouter,
/// Together and Ollama.
pub struct OpenAiCompatibleProvider {
    name: &'static str,
    client: Client,
    settings: ProviderSettings,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &'static str, settings: ProviderSettings) -> Result<Self, GenerationError> {
        Ok(Self {
            name,
            client: http_client(settings.timeout)?,
            settings,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatibleProvider {
    fn provider_name(&self) -> &str {
        self.name
    }

    async fn generate_response(
        &self,
        cancel: &CancellationToken,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, GenerationError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.settings.base_url))
            .json(&json!({
                "model": self.settings.model,
                "messages": [
                    {"role": "system", "content": system_prompt},
                    {"role": "user", "content": user_message}
                ],
                "temperature": self.settings.temperature,
                "max_tokens": self.settings.max_tokens,
            }));
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }
        let completion: ChatCompletion = post_json(cancel, request).await?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        non_empty(text)
    }
}

/// Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    settings: ProviderSettings,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, GenerationError> {
        Ok(Self {
            client: http_client(settings.timeout)?,
            settings,
        })
    }
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn generate_response(
        &self,
        cancel: &CancellationToken,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, GenerationError> {
        let request = self
            .client
            .post(format!("{}/messages", self.settings.base_url))
            .header("x-api-key", self.settings.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.settings.model,
                "system": system_prompt,
                "messages": [{"role": "user", "content": user_message}],
                "max_tokens": self.settings.max_tokens,
                "temperature": self.settings.temperature,
            }));
        let response: AnthropicResponse = post_json(cancel, request).await?;
        let text: String = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        non_empty(text)
    }
}

/// Google Gemini `generateContent`.
pub struct GeminiProvider {
    client: Client,
    settings: ProviderSettings,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, GenerationError> {
        Ok(Self {
            client: http_client(settings.timeout)?,
            settings,
        })
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    fn provider_name(&self) -> &str {
        "gemini"
    }

    async fn generate_response(
        &self,
        cancel: &CancellationToken,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, GenerationError> {
        let request = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.settings.base_url, self.settings.model
            ))
            .header("x-goog-api-key", self.settings.api_key.as_deref().unwrap_or_default())
            .json(&json!({
                "systemInstruction": {"parts": [{"text": system_prompt}]},
                "contents": [{"role": "user", "parts": [{"text": user_message}]}],
                "generationConfig": {
                    "temperature": self.settings.temperature,
                    "maxOutputTokens": self.settings.max_tokens,
                }
            }));
        let response: GeminiResponse = post_json(cancel, request).await?;
        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        non_empty(text)
    }
}
