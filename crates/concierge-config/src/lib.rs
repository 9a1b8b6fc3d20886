use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_SCHEMA: &str = include_str!("../../../config/config.schema.json");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub retrieval: Retrieval,
    pub generation: Generation,
    #[serde(default)]
    pub embedding: Option<Embedding>,
    #[serde(default)]
    pub vector: Option<Vector>,
    pub dispatch: Dispatch,
    pub conversation_log: ConversationLog,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: StoreKind,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    /// YAML file with tenants and knowledge loaded at startup.
    #[serde(default)]
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
    #[serde(default = "default_apology_text")]
    pub apology_text: String,
    #[serde(default = "default_fallback_text")]
    pub fallback_text: String,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            generation_timeout_ms: default_generation_timeout_ms(),
            apology_text: default_apology_text(),
            fallback_text: default_fallback_text(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    Structured,
    Vector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retrieval {
    pub strategy: RetrievalStrategy,
    #[serde(default = "default_faq_limit")]
    pub faq_limit: usize,
    #[serde(default = "default_product_limit")]
    pub product_limit: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for Retrieval {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::Structured,
            faq_limit: default_faq_limit(),
            product_limit: default_product_limit(),
            min_score: default_min_score(),
            max_results: default_max_results(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GenerationProviderKind {
    Openai,
    Deepseek,
    Groq,
    Openrouter,
    Together,
    Ollama,
    Anthropic,
    Gemini,
}

/// Unset fields fall back to the selected provider's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub provider: GenerationProviderKind,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    Openai,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimension: usize,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorKind {
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vector {
    pub kind: VectorKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_vector_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    Webhook,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    pub kind: DispatchKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub auth_token_env: Option<String>,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the new record and emit a warning.
    #[default]
    Reject,
    /// Wait for queue capacity.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLog {
    pub jsonl_path: String,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_log_workers")]
    pub workers: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_cooldown_ms() -> u64 {
    2_000
}

fn default_generation_timeout_ms() -> u64 {
    10_000
}

fn default_apology_text() -> String {
    "Maaf, sistem kami sedang mengalami gangguan. Silakan coba lagi beberapa saat lagi.".to_string()
}

fn default_fallback_text() -> String {
    "Maaf, saya belum bisa menjawab saat ini. Tim kami akan segera membantu Anda.".to_string()
}

fn default_faq_limit() -> usize {
    50
}

fn default_product_limit() -> usize {
    100
}

fn default_min_score() -> f32 {
    0.7
}

fn default_max_results() -> usize {
    5
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_embedding_timeout_ms() -> u64 {
    15_000
}

fn default_collection() -> String {
    "knowledge_base".to_string()
}

fn default_vector_timeout_ms() -> u64 {
    10_000
}

fn default_dispatch_timeout_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_log_workers() -> usize {
    2
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind == StoreKind::Memory && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == StoreKind::Sqlite && is_blank(cfg.store.sqlite_path.as_deref()) {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.engine.cooldown_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "engine.cooldown_ms must be >= 1".to_string(),
        ));
    }
    if cfg.engine.generation_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "engine.generation_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.engine.apology_text.trim().is_empty() || cfg.engine.fallback_text.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "engine.apology_text and engine.fallback_text must not be empty".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&cfg.retrieval.min_score) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "retrieval.min_score={} must be within [0, 1]",
            cfg.retrieval.min_score
        )));
    }
    if cfg.retrieval.faq_limit == 0 || cfg.retrieval.product_limit == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "retrieval.faq_limit and retrieval.product_limit must be >= 1".to_string(),
        ));
    }
    if cfg.retrieval.chunk_size == 0 || cfg.retrieval.chunk_overlap >= cfg.retrieval.chunk_size {
        return Err(ConfigError::UnsupportedConfig(
            "retrieval.chunk_overlap must be smaller than retrieval.chunk_size".to_string(),
        ));
    }
    if cfg.retrieval.strategy == RetrievalStrategy::Vector {
        let Some(embedding) = &cfg.embedding else {
            return Err(ConfigError::UnsupportedConfig(
                "embedding section is required when retrieval.strategy=vector".to_string(),
            ));
        };
        if embedding.dimension == 0 {
            return Err(ConfigError::UnsupportedConfig(
                "embedding.dimension must be >= 1".to_string(),
            ));
        }
        match &cfg.vector {
            None => {
                return Err(ConfigError::UnsupportedConfig(
                    "vector section is required when retrieval.strategy=vector".to_string(),
                ))
            }
            Some(v) if v.kind == VectorKind::Qdrant && is_blank(v.url.as_deref()) => {
                return Err(ConfigError::UnsupportedConfig(
                    "vector.url is required when vector.kind=qdrant".to_string(),
                ))
            }
            Some(_) => {}
        }
    }
    if cfg.dispatch.kind == DispatchKind::Webhook && is_blank(cfg.dispatch.endpoint.as_deref()) {
        return Err(ConfigError::UnsupportedConfig(
            "dispatch.endpoint is required when dispatch.kind=webhook".to_string(),
        ));
    }
    if cfg.conversation_log.queue_capacity == 0 || cfg.conversation_log.workers == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "conversation_log.queue_capacity and conversation_log.workers must be >= 1"
                .to_string(),
        ));
    }
    Ok(())
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("concierge-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

retrieval:
  strategy: "structured"

generation:
  provider: "openai"
  api_key_env: "OPENAI_API_KEY"

dispatch:
  kind: "log"

conversation_log:
  jsonl_path: "./conversations.jsonl"
"#
        .to_string()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("minimal config should be accepted");
        assert_eq!(cfg.engine.cooldown_ms, 2000);
        assert_eq!(cfg.engine.generation_timeout_ms, 10_000);
        assert_eq!(cfg.retrieval.faq_limit, 50);
        assert_eq!(cfg.retrieval.product_limit, 100);
        assert!((cfg.retrieval.min_score - 0.7).abs() < f32::EPSILON);
        assert_eq!(cfg.conversation_log.overflow, OverflowPolicy::Reject);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        assert_eq!(cfg.generation.provider, GenerationProviderKind::Openai);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let cfg = parse_and_validate(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ))
        .expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, StoreKind::Sqlite);
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_when_memory() {
        let err = parse_and_validate(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ))
        .expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_generation_provider_in_schema() {
        let err = parse_and_validate(&base_yaml().replace("\"openai\"", "\"mystery\""))
            .expect_err("expected schema failure");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn vector_strategy_requires_embedding_section() {
        let err = parse_and_validate(&base_yaml().replace("\"structured\"", "\"vector\""))
            .expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn vector_strategy_with_qdrant_is_accepted() {
        let yaml = base_yaml().replace("\"structured\"", "\"vector\"")
            + r#"
embedding:
  provider: "openai"
  model: "text-embedding-3-small"
  dimension: 1536
  api_key_env: "OPENAI_API_KEY"

vector:
  kind: "qdrant"
  url: "http://localhost:6333"
"#;
        let cfg = parse_and_validate(&yaml).expect("vector config should be accepted");
        let vector = cfg.vector.expect("vector section");
        assert_eq!(vector.kind, VectorKind::Qdrant);
        assert_eq!(vector.collection, "knowledge_base");
    }

    #[test]
    fn webhook_dispatch_requires_endpoint() {
        let err = parse_and_validate(&base_yaml().replace("kind: \"log\"", "kind: \"webhook\""))
            .expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_zero_cooldown() {
        let yaml = base_yaml() + "\nengine:\n  cooldown_ms: 0\n";
        let err = parse_and_validate(&yaml).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/example-config.yaml");
        let cfg = load_and_validate(path).expect("example config should validate");
        assert_eq!(cfg.store.kind, StoreKind::Sqlite);
        assert_eq!(cfg.generation.provider, GenerationProviderKind::Openai);
        assert_eq!(cfg.retrieval.faq_limit, 50);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = load_and_validate("/definitely/not/here.yaml").expect_err("expected read error");
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
