use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concierge_config::{Embedding, EmbeddingProviderKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::EmbeddingError;

/// Turns text into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

pub fn build_embedding_provider(
    cfg: &Embedding,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let api_key = match cfg.api_key_env.as_deref() {
        Some(var) => Some(std::env::var(var).map_err(|_| {
            EmbeddingError::Config(format!("environment variable {var} is not set"))
        })?),
        None => None,
    };
    build_embedding_provider_with_key(cfg, api_key)
}

pub fn build_embedding_provider_with_key(
    cfg: &Embedding,
    api_key: Option<String>,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let client = Client::builder()
        .timeout(Duration::from_millis(cfg.timeout_ms))
        .build()
        .map_err(|e| EmbeddingError::Config(e.to_string()))?;
    match cfg.provider {
        EmbeddingProviderKind::Openai => {
            let api_key = api_key.ok_or_else(|| {
                EmbeddingError::Config("openai embeddings need embedding.api_key_env".to_string())
            })?;
            let base_url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string());
            Ok(Arc::new(OpenAiEmbeddings {
                client,
                api_key,
                base_url: trim_base(&base_url),
                model: cfg.model.clone(),
                dimension: cfg.dimension,
            }))
        }
        EmbeddingProviderKind::Ollama => {
            let base_url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string());
            Ok(Arc::new(OllamaEmbeddings {
                client,
                base_url: trim_base(&base_url),
                model: cfg.model.clone(),
                dimension: cfg.dimension,
            }))
        }
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn check_dimension(expected: usize, vector: &[f32]) -> Result<(), EmbeddingError> {
    if vector.len() != expected {
        return Err(EmbeddingError::Dimension {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

fn transport(e: reqwest::Error) -> EmbeddingError {
    EmbeddingError::Transport(e.to_string())
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, EmbeddingError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EmbeddingError::Api {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| EmbeddingError::Decode(e.to_string()))
}

/// `POST {base}/v1/embeddings`, also served by most OpenAI-compatible gateways.
pub struct OpenAiEmbeddings {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::Decode("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&OpenAiEmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(transport)?;
        let mut body: OpenAiEmbeddingResponse = read_json(response).await?;
        if body.data.len() != texts.len() {
            return Err(EmbeddingError::Decode(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        body.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = body.data.into_iter().map(|d| d.embedding).collect();
        for v in &vectors {
            check_dimension(self.dimension, v)?;
        }
        Ok(vectors)
    }
}

/// `POST {base}/api/embeddings` on a local Ollama daemon.
pub struct OllamaEmbeddings {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&OllamaEmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(transport)?;
        let body: OllamaEmbeddingResponse = read_json(response).await?;
        check_dimension(self.dimension, &body.embedding)?;
        Ok(body.embedding)
    }
}
