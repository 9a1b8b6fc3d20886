pub mod conversation_log;
pub mod dispatch;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod generation;
pub mod knowledge;
pub mod vector;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use concierge_config::{Config, RetrievalStrategy, StoreKind};
use concierge_contracts::{IncomingEvent, API_VERSION};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

pub use conversation_log::{
    ConversationLogger, ConversationSink, JsonlConversationSink, LoggerStats,
};
pub use dispatch::{build_dispatcher, LogDispatcher, ReplyDispatcher, WebhookDispatcher};
pub use embedding::{build_embedding_provider, EmbeddingProvider};
pub use engine::{Engine, EngineParts, EngineSettings, FailureStage, PipelineOutcome};
pub use error::{
    DispatchError, EmbeddingError, EngineError, GenerationError, LogError, RetrievalError,
    StoreError, VectorError,
};
pub use generation::{build_generation_provider, generate_with_deadline, GenerationProvider};
pub use knowledge::{
    BusinessProfile, KnowledgeRetriever, KnowledgeStore, StructuredRetriever, TenantResolver,
};
pub use vector::{
    build_vector_store, ChunkSettings, MemoryVectorStore, QdrantStore, SemanticRetriever,
    VectorRetriever, VectorStore,
};

use knowledge::KnowledgeDocument;

/// `metadata.source` of points mirrored from the structured knowledge store.
const STORE_SOURCE: &str = "knowledge_store";

pub async fn serve(cfg: Config) -> Result<(), EngineError> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| EngineError::ListenAddr(format!("{e}")))?;

    let state = AppState::from_config(&cfg).await?;
    let shutdown = state.engine.shutdown_token();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c, running until killed");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested, cancelling in-flight generation");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

pub async fn build_app(cfg: Config) -> Result<Router, EngineError> {
    Ok(router(AppState::from_config(&cfg).await?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/messages", post(messages))
        .route("/v1/tenants/{tenant_id}/documents", post(documents))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
    index: Option<Arc<VectorRetriever>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, index: Option<Arc<VectorRetriever>>) -> Self {
        Self { engine, index }
    }

    pub async fn from_config(cfg: &Config) -> Result<Self, EngineError> {
        let store = Arc::new(match cfg.store.kind {
            StoreKind::Memory => KnowledgeStore::memory(),
            StoreKind::Sqlite => {
                let path = cfg.store.sqlite_path.as_deref().ok_or_else(|| {
                    EngineError::Config(
                        "store.sqlite_path is required for sqlite store".to_string(),
                    )
                })?;
                KnowledgeStore::sqlite(path)?
            }
        });
        let seeded = match cfg.store.seed_path.as_deref() {
            Some(path) => store.load_seed(path).await?,
            None => vec![],
        };

        let (retriever, index) = match cfg.retrieval.strategy {
            RetrievalStrategy::Structured => {
                let structured: Arc<dyn KnowledgeRetriever> = Arc::new(StructuredRetriever::new(
                    store.clone(),
                    cfg.retrieval.faq_limit,
                    cfg.retrieval.product_limit,
                ));
                (structured, None)
            }
            RetrievalStrategy::Vector => {
                let embedding = cfg.embedding.as_ref().ok_or_else(|| {
                    EngineError::Config(
                        "embedding section is required for vector retrieval".to_string(),
                    )
                })?;
                let vector = cfg.vector.as_ref().ok_or_else(|| {
                    EngineError::Config(
                        "vector section is required for vector retrieval".to_string(),
                    )
                })?;
                let index = Arc::new(VectorRetriever::new(
                    build_vector_store(vector)?,
                    build_embedding_provider(embedding)?,
                    vector.collection.clone(),
                    cfg.retrieval.min_score,
                    ChunkSettings {
                        size: cfg.retrieval.chunk_size,
                        overlap: cfg.retrieval.chunk_overlap,
                    },
                ));
                let collection = index.ensure_collection().await?;
                info!(
                    collection = %collection.name,
                    created = collection.created,
                    points = ?collection.points_count,
                    "vector collection ready"
                );
                for tenant_id in &seeded {
                    index_tenant_knowledge(&store, &index, tenant_id).await?;
                }
                let semantic: Arc<dyn KnowledgeRetriever> = Arc::new(SemanticRetriever::new(
                    store.clone(),
                    index.clone(),
                    cfg.retrieval.max_results,
                ));
                (semantic, Some(index))
            }
        };

        let provider = build_generation_provider(&cfg.generation)?;
        let dispatcher = build_dispatcher(&cfg.dispatch)?;
        let sink = Arc::new(
            JsonlConversationSink::open(
                &cfg.conversation_log.jsonl_path,
                cfg.conversation_log.sqlite_path.as_deref(),
            )
            .await?,
        );
        let logger = Arc::new(ConversationLogger::start(
            sink,
            cfg.conversation_log.queue_capacity,
            cfg.conversation_log.workers,
            cfg.conversation_log.overflow,
        ));

        info!(
            provider = provider.provider_name(),
            strategy = retriever.strategy(),
            "engine ready"
        );
        let engine = Engine::new(
            EngineSettings::from(&cfg.engine),
            EngineParts {
                resolver: store.clone(),
                retriever,
                provider,
                dispatcher,
                logger,
            },
        );
        Ok(Self::new(Arc::new(engine), index))
    }
}

/// Copy every FAQ, product and entry of a tenant from the structured store into the
/// vector index. Points from an earlier sync that the store no longer yields are
/// removed once the new ones are written; uploaded documents are left alone.
pub async fn index_tenant_knowledge(
    store: &KnowledgeStore,
    index: &VectorRetriever,
    tenant_id: &str,
) -> Result<usize, EngineError> {
    let docs = store.documents(tenant_id).await?;
    let sync_id = uuid::Uuid::new_v4().simple().to_string();
    let mut points = 0;
    for KnowledgeDocument {
        doc_type,
        doc_id,
        text,
        mut metadata,
    } in docs
    {
        metadata.insert("source".to_string(), json!(STORE_SOURCE));
        metadata.insert("sync_id".to_string(), json!(sync_id));
        points += index
            .add_document_chunked(tenant_id, &doc_type, &doc_id, &text, metadata)
            .await?;
    }
    index.delete_stale_sync(tenant_id, STORE_SOURCE, &sync_id).await?;
    info!(tenant_id, points, "tenant knowledge indexed");
    Ok(points)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Deserialize)]
struct InboundMessage {
    sender_id: String,
    text: String,
    #[serde(default)]
    ts: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct DocumentInput {
    doc_type: String,
    doc_id: String,
    text: String,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({"error": {"code": code, "message": message.into()}})),
    )
}

async fn messages(
    State(state): State<AppState>,
    Json(msg): Json<InboundMessage>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if msg.sender_id.trim().is_empty() || msg.text.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "sender_id and text must not be empty",
        ));
    }
    let event = IncomingEvent::new(msg.sender_id, msg.text).with_sent_at(msg.ts);
    let engine = state.engine.clone();
    tokio::spawn(async move {
        engine.handle_event(event).await;
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "api_version": API_VERSION})),
    ))
}

async fn documents(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(doc): Json<DocumentInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Some(index) = &state.index else {
        return Err(api_error(
            StatusCode::CONFLICT,
            "vector_retrieval_disabled",
            format!(
                "documents are only indexed under vector retrieval, active strategy is {}",
                state.engine.retrieval_strategy()
            ),
        ));
    };
    if doc.doc_type.trim().is_empty() || doc.doc_id.trim().is_empty() || doc.text.trim().is_empty()
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "doc_type, doc_id and text must not be empty",
        ));
    }
    let chunks = index
        .add_document_chunked(
            &tenant_id,
            &doc.doc_type,
            &doc.doc_id,
            &doc.text,
            doc.metadata.unwrap_or_default(),
        )
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, "index_failed", e.to_string()))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "tenant_id": tenant_id,
            "doc_type": doc.doc_type,
            "doc_id": doc.doc_id,
            "chunks": chunks,
        })),
    ))
}
