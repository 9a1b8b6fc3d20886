use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concierge_config::{Vector, VectorKind};
use concierge_contracts::{
    CollectionSpec, Condition, Distance, Filter, KnowledgeSnapshot, Range, SearchResult,
    TenantContext, VectorPoint, TENANT_PAYLOAD_KEY,
};
use concierge_kernel::{
    chunk_doc_id, chunk_text, cosine_similarity, filter_matches, format_relevant_context,
    point_id, point_key,
};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::embedding::EmbeddingProvider;
use crate::error::{RetrievalError, VectorError};
use crate::knowledge::{KnowledgeRetriever, KnowledgeStore};

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: Option<usize>,
    pub points_count: Option<usize>,
    /// False when the collection already existed.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Map<String, Value>,
}

/// Similarity index over tenant-scoped points.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Create the collection, or describe it when it already exists.
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<CollectionInfo, VectorError>;

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), VectorError>;

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorError>;

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<(), VectorError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<usize, VectorError>;
}

pub fn build_vector_store(cfg: &Vector) -> Result<Arc<dyn VectorStore>, VectorError> {
    match cfg.kind {
        VectorKind::Memory => Ok(Arc::new(MemoryVectorStore::default())),
        VectorKind::Qdrant => {
            let url = cfg
                .url
                .clone()
                .ok_or_else(|| {
                    VectorError::Config("vector.url is required for qdrant".to_string())
                })?;
            let api_key = match cfg.api_key_env.as_deref() {
                Some(var) => Some(std::env::var(var).map_err(|_| {
                    VectorError::Config(format!("environment variable {var} is not set"))
                })?),
                None => None,
            };
            Ok(Arc::new(QdrantStore::new(
                &url,
                api_key,
                Duration::from_millis(cfg.timeout_ms),
            )?))
        }
    }
}

/// Qdrant over its REST API.
pub struct QdrantStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct QdrantEnvelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct QdrantCollection {
    #[serde(default)]
    points_count: Option<usize>,
    #[serde(default)]
    config: Option<QdrantCollectionConfig>,
}

#[derive(Deserialize)]
struct QdrantCollectionConfig {
    params: QdrantCollectionParams,
}

#[derive(Deserialize)]
struct QdrantCollectionParams {
    vectors: QdrantVectorParams,
}

#[derive(Deserialize)]
struct QdrantVectorParams {
    size: usize,
}

#[derive(Deserialize)]
struct QdrantScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct QdrantCount {
    count: usize,
}

impl QdrantStore {
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, VectorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VectorError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn with_key(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, VectorError> {
        let response = self
            .with_key(builder)
            .send()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VectorError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: QdrantEnvelope<T> = response
            .json()
            .await
            .map_err(|e| VectorError::Decode(e.to_string()))?;
        Ok(envelope.result)
    }

    async fn collection_info(&self, name: &str) -> Result<CollectionInfo, VectorError> {
        let info: QdrantCollection = self
            .send(self.client.get(format!("{}/collections/{name}", self.base_url)))
            .await?;
        Ok(CollectionInfo {
            name: name.to_string(),
            dimension: info.config.map(|c| c.params.vectors.size),
            points_count: info.points_count,
            created: false,
        })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend_name(&self) -> &'static str {
        "qdrant"
    }

    async fn ensure_collection(
        &self,
        spec: &CollectionSpec,
    ) -> Result<CollectionInfo, VectorError> {
        let distance = match spec.distance {
            Distance::Cosine => "Cosine",
        };
        let create = self
            .send::<Value>(
                self.client
                    .put(format!("{}/collections/{}", self.base_url, spec.name))
                    .json(&json!({"vectors": {"size": spec.dimension, "distance": distance}})),
            )
            .await;
        match create {
            Ok(_) => {
                info!(collection = %spec.name, dimension = spec.dimension, "collection created");
                Ok(CollectionInfo {
                    name: spec.name.clone(),
                    dimension: Some(spec.dimension),
                    points_count: Some(0),
                    created: true,
                })
            }
            Err(create_err) => match self.collection_info(&spec.name).await {
                Ok(info) => {
                    debug!(collection = %spec.name, "collection already exists");
                    Ok(info)
                }
                Err(_) => Err(create_err),
            },
        }
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), VectorError> {
        if points.is_empty() {
            return Ok(());
        }
        self.send::<Value>(
            self.client
                .put(format!("{}/collections/{collection}/points?wait=true", self.base_url))
                .json(&json!({ "points": points })),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if !filter.is_empty() {
            body["filter"] = json!(filter);
        }
        let hits: Vec<QdrantScoredPoint> = self
            .send(
                self.client
                    .post(format!("{}/collections/{collection}/points/search", self.base_url))
                    .json(&body),
            )
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| ScoredPoint {
                id: match hit.id {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
                score: hit.score,
                payload: hit.payload.unwrap_or_default(),
            })
            .collect())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<(), VectorError> {
        self.send::<Value>(
            self.client
                .post(format!(
                    "{}/collections/{collection}/points/delete?wait=true",
                    self.base_url
                ))
                .json(&json!({ "filter": filter })),
        )
        .await?;
        Ok(())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<usize, VectorError> {
        let mut body = json!({ "exact": true });
        if !filter.is_empty() {
            body["filter"] = json!(filter);
        }
        let count: QdrantCount = self
            .send(
                self.client
                    .post(format!("{}/collections/{collection}/points/count", self.base_url))
                    .json(&body),
            )
            .await?;
        Ok(count.count)
    }
}

/// Brute-force cosine index kept in process memory.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

struct MemoryCollection {
    dimension: usize,
    points: BTreeMap<String, VectorPoint>,
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_collection(
        &self,
        spec: &CollectionSpec,
    ) -> Result<CollectionInfo, VectorError> {
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(&spec.name) {
            return Ok(CollectionInfo {
                name: spec.name.clone(),
                dimension: Some(existing.dimension),
                points_count: Some(existing.points.len()),
                created: false,
            });
        }
        collections.insert(
            spec.name.clone(),
            MemoryCollection {
                dimension: spec.dimension,
                points: BTreeMap::new(),
            },
        );
        Ok(CollectionInfo {
            name: spec.name.clone(),
            dimension: Some(spec.dimension),
            points_count: Some(0),
            created: true,
        })
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), VectorError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| VectorError::MissingCollection(collection.to_string()))?;
        if let Some(bad) = points.iter().find(|p| p.vector.len() != target.dimension) {
            return Err(VectorError::Dimension {
                collection: collection.to_string(),
                expected: target.dimension,
                actual: bad.vector.len(),
            });
        }
        for point in points {
            target.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| VectorError::MissingCollection(collection.to_string()))?;
        let mut hits: Vec<ScoredPoint> = target
            .points
            .values()
            .filter(|p| filter_matches(filter, &p.payload))
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<(), VectorError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| VectorError::MissingCollection(collection.to_string()))?;
        target.points.retain(|_, p| !filter_matches(filter, &p.payload));
        Ok(())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<usize, VectorError> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| VectorError::MissingCollection(collection.to_string()))?;
        Ok(target
            .points
            .values()
            .filter(|p| filter_matches(filter, &p.payload))
            .count())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkSettings {
    pub size: usize,
    pub overlap: usize,
}

/// Tenant-scoped document indexing and semantic search over one collection.
pub struct VectorRetriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    min_score: f32,
    chunking: ChunkSettings,
}

impl VectorRetriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: impl Into<String>,
        min_score: f32,
        chunking: ChunkSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            collection: collection.into(),
            min_score,
            chunking,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn ensure_collection(&self) -> Result<CollectionInfo, VectorError> {
        let info = self
            .store
            .ensure_collection(&CollectionSpec {
                name: self.collection.clone(),
                dimension: self.embedder.dimension(),
                distance: Distance::Cosine,
            })
            .await?;
        if let Some(dimension) = info.dimension {
            if dimension != self.embedder.dimension() {
                return Err(VectorError::Dimension {
                    collection: self.collection.clone(),
                    expected: dimension,
                    actual: self.embedder.dimension(),
                });
            }
        }
        Ok(info)
    }

    /// Embed and upsert one document. The point id is derived from
    /// (tenant, type, id), so writing the same triple again replaces the point.
    pub async fn add_document(
        &self,
        tenant_id: &str,
        doc_type: &str,
        doc_id: &str,
        text: &str,
        metadata: Map<String, Value>,
    ) -> Result<String, VectorError> {
        let vector = self.embedder.embed(text).await?;
        let point = build_point(tenant_id, doc_type, doc_id, text, metadata, vector);
        let id = point.id.clone();
        self.store.upsert(&self.collection, vec![point]).await?;
        debug!(tenant_id, doc_type, doc_id, "document indexed");
        Ok(id)
    }

    /// Split `text` into overlapping windows and index each as its own point tagged
    /// with `parent_id`, `chunk_index` and `total_chunks`. The new chunks are written
    /// before anything is removed, so a failed update leaves the previous version intact.
    pub async fn add_document_chunked(
        &self,
        tenant_id: &str,
        doc_type: &str,
        doc_id: &str,
        text: &str,
        metadata: Map<String, Value>,
    ) -> Result<usize, VectorError> {
        let chunks = chunk_text(text, self.chunking.size, self.chunking.overlap);
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        let points: Vec<VectorPoint> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                let mut meta = metadata.clone();
                meta.insert("parent_id".to_string(), json!(doc_id));
                meta.insert("chunk_index".to_string(), json!(chunk.index));
                meta.insert("total_chunks".to_string(), json!(chunk.total));
                build_point(
                    tenant_id,
                    doc_type,
                    &chunk_doc_id(doc_id, chunk.index),
                    &chunk.text,
                    meta,
                    vector,
                )
            })
            .collect();
        let total = points.len();
        self.store.upsert(&self.collection, points).await?;
        self.delete_stale_chunks(tenant_id, doc_type, doc_id, total).await?;
        info!(tenant_id, doc_type, doc_id, chunks = total, "document indexed");
        Ok(total)
    }

    /// Drop chunks at index `total` and above, plus any unchunked point stored
    /// under the bare `doc_id`.
    async fn delete_stale_chunks(
        &self,
        tenant_id: &str,
        doc_type: &str,
        doc_id: &str,
        total: usize,
    ) -> Result<(), VectorError> {
        let scope = || Filter::tenant(tenant_id).and(Condition::matches("doc_type", doc_type));
        let surplus = scope()
            .and(Condition::matches("metadata.parent_id", doc_id))
            .and(Condition::in_range(
                "metadata.chunk_index",
                Range {
                    gte: Some(total as f64),
                    ..Range::default()
                },
            ));
        self.store.delete_by_filter(&self.collection, &surplus).await?;
        let unchunked = scope().and(Condition::matches("doc_id", doc_id));
        self.store.delete_by_filter(&self.collection, &unchunked).await
    }

    pub async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>, VectorError> {
        self.search_with_filter(tenant_id, query, limit, Filter::default())
            .await
    }

    pub async fn search_by_type(
        &self,
        tenant_id: &str,
        doc_type: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>, VectorError> {
        let filter = Filter::default().and(Condition::matches("doc_type", doc_type));
        self.search_with_filter(tenant_id, query, limit, filter).await
    }

    /// Similarity search restricted to `tenant_id`; `extra` narrows it further.
    pub async fn search_with_filter(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
        extra: Filter,
    ) -> Result<Vec<SearchResult>, VectorError> {
        let vector = self.embedder.embed(query).await?;
        let mut filter = extra;
        filter
            .must
            .insert(0, Condition::matches(TENANT_PAYLOAD_KEY, tenant_id));
        let hits = self
            .store
            .search(&self.collection, &vector, &filter, limit)
            .await?;
        let mut results: Vec<SearchResult> = hits.into_iter().map(to_search_result).collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(results)
    }

    pub async fn get_relevant_context(
        &self,
        tenant_id: &str,
        query: &str,
        max_results: usize,
    ) -> Result<String, VectorError> {
        let results = self.search(tenant_id, query, max_results).await?;
        Ok(format_relevant_context(&results, self.min_score))
    }

    /// Remove a document, including every chunk indexed under it.
    pub async fn delete_document(
        &self,
        tenant_id: &str,
        doc_type: &str,
        doc_id: &str,
    ) -> Result<(), VectorError> {
        let filter = Filter {
            must: vec![
                Condition::matches(TENANT_PAYLOAD_KEY, tenant_id),
                Condition::matches("doc_type", doc_type),
            ],
            should: vec![
                Condition::matches("doc_id", doc_id),
                Condition::matches("metadata.parent_id", doc_id),
            ],
            must_not: vec![],
        };
        self.store.delete_by_filter(&self.collection, &filter).await
    }

    /// Remove a tenant's points tagged with `metadata.source == source` that were not
    /// written by the sync identified by `sync_id`.
    pub async fn delete_stale_sync(
        &self,
        tenant_id: &str,
        source: &str,
        sync_id: &str,
    ) -> Result<(), VectorError> {
        let filter = Filter {
            must_not: vec![Condition::matches("metadata.sync_id", sync_id)],
            ..Filter::tenant(tenant_id).and(Condition::matches("metadata.source", source))
        };
        self.store.delete_by_filter(&self.collection, &filter).await
    }

    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<(), VectorError> {
        self.store
            .delete_by_filter(&self.collection, &Filter::tenant(tenant_id))
            .await?;
        info!(tenant_id, "tenant documents deleted");
        Ok(())
    }

    pub async fn count(&self, tenant_id: &str) -> Result<usize, VectorError> {
        self.store
            .count(&self.collection, &Filter::tenant(tenant_id))
            .await
    }
}

fn build_point(
    tenant_id: &str,
    doc_type: &str,
    doc_id: &str,
    text: &str,
    metadata: Map<String, Value>,
    vector: Vec<f32>,
) -> VectorPoint {
    let mut payload = Map::new();
    payload.insert(TENANT_PAYLOAD_KEY.to_string(), json!(tenant_id));
    payload.insert("doc_type".to_string(), json!(doc_type));
    payload.insert("doc_id".to_string(), json!(doc_id));
    payload.insert("point_key".to_string(), json!(point_key(tenant_id, doc_type, doc_id)));
    payload.insert("text".to_string(), json!(text));
    payload.insert("metadata".to_string(), Value::Object(metadata));
    VectorPoint {
        id: point_id(tenant_id, doc_type, doc_id),
        vector,
        payload,
    }
}

fn to_search_result(hit: ScoredPoint) -> SearchResult {
    let field = |key: &str| {
        hit.payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    SearchResult {
        score: hit.score,
        text: field("text"),
        doc_type: field("doc_type"),
        doc_id: field("doc_id"),
        metadata: hit
            .payload
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    }
}

/// Vector strategy: the tenant's business profile plus a block of semantically
/// relevant knowledge for the query.
pub struct SemanticRetriever {
    store: Arc<KnowledgeStore>,
    index: Arc<VectorRetriever>,
    max_results: usize,
}

impl SemanticRetriever {
    pub fn new(
        store: Arc<KnowledgeStore>,
        index: Arc<VectorRetriever>,
        max_results: usize,
    ) -> Self {
        Self {
            store,
            index,
            max_results,
        }
    }
}

#[async_trait]
impl KnowledgeRetriever for SemanticRetriever {
    fn strategy(&self) -> &'static str {
        "vector"
    }

    async fn retrieve(
        &self,
        tenant: &TenantContext,
        query: &str,
    ) -> Result<KnowledgeSnapshot, RetrievalError> {
        let profile = self.store.business_profile(tenant.tenant_id()).await?;
        let relevant_context = self
            .index
            .get_relevant_context(tenant.tenant_id(), query, self.max_results)
            .await?;
        Ok(KnowledgeSnapshot {
            business_name: profile.business_name,
            tone: profile.tone,
            relevant_context,
            ..KnowledgeSnapshot::default()
        })
    }
}
