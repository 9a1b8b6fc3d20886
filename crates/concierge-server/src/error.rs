use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no tenant registered for sender {0}")]
    UnknownSender(String),
    #[error("no business profile for tenant {0}")]
    UnknownTenant(String),
    #[error("incomplete tenant mapping for sender {sender_id}: {field} is empty")]
    IncompleteTenant {
        sender_id: String,
        field: &'static str,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored value is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("seed load failed: {0}")]
    Seed(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding transport error: {0}")]
    Transport(String),
    #[error("embedding api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("embedding response could not be decoded: {0}")]
    Decode(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding provider misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector store transport error: {0}")]
    Transport(String),
    #[error("vector store returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("vector store response could not be decoded: {0}")]
    Decode(String),
    #[error("collection {0} does not exist")]
    MissingCollection(String),
    #[error("vector has {actual} dimensions, collection {collection} expects {expected}")]
    Dimension {
        collection: String,
        expected: usize,
        actual: usize,
    },
    #[error("vector store misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vector(#[from] VectorError),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation deadline exceeded")]
    Timeout,
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation transport error: {0}")]
    Transport(String),
    #[error("generation api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("generation returned no text")]
    EmptyResponse,
    #[error("generation response could not be decoded: {0}")]
    Decode(String),
    #[error("generation provider misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch transport error: {0}")]
    Transport(String),
    #[error("dispatch endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("dispatcher misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("conversation log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("conversation record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("conversation mirror error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Startup failures while wiring the service from configuration.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid listen_addr: {0}")]
    ListenAddr(String),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
