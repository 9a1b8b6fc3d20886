mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use concierge_contracts::{
    CollectionSpec, Distance, Faq, Filter, TenantContext, VectorPoint, DOC_TYPE_FAQ,
    DOC_TYPE_PRODUCT,
};
use concierge_server::vector::{CollectionInfo, ScoredPoint};
use concierge_server::{
    index_tenant_knowledge, ChunkSettings, EmbeddingError, EmbeddingProvider, KnowledgeRetriever,
    MemoryVectorStore, SemanticRetriever, VectorError, VectorRetriever, VectorStore,
};
use serde_json::{json, Map, Value};
use support::*;

const DIM: usize = 32;

fn retriever(store: Arc<dyn VectorStore>, chunking: ChunkSettings) -> VectorRetriever {
    VectorRetriever::new(store, KeywordEmbedder::new(DIM), "knowledge_base", 0.7, chunking)
}

async fn memory_retriever() -> VectorRetriever {
    let index = retriever(
        Arc::new(MemoryVectorStore::default()),
        ChunkSettings {
            size: 40,
            overlap: 10,
        },
    );
    index.ensure_collection().await.unwrap();
    index
}

fn meta(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn ensure_collection_is_idempotent() {
    let store = MemoryVectorStore::default();
    let spec = CollectionSpec {
        name: "kb".to_string(),
        dimension: 4,
        distance: Distance::Cosine,
    };
    let first = store.ensure_collection(&spec).await.unwrap();
    let second = store.ensure_collection(&spec).await.unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.dimension, Some(4));
}

#[tokio::test]
async fn adding_the_same_document_twice_keeps_one_point() {
    let index = memory_retriever().await;
    let first = index
        .add_document("toko-x", DOC_TYPE_FAQ, "42", "Jam buka setiap hari", Map::new())
        .await
        .unwrap();
    let second = index
        .add_document("toko-x", DOC_TYPE_FAQ, "42", "Jam buka setiap hari kerja", Map::new())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(index.count("toko-x").await.unwrap(), 1);
    let hits = index.search("toko-x", "jam buka", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, "Jam buka setiap hari kerja");
}

#[tokio::test]
async fn search_never_crosses_tenants() {
    let index = memory_retriever().await;
    index
        .add_document("toko-x", DOC_TYPE_FAQ, "1", "ongkir gratis jakarta", Map::new())
        .await
        .unwrap();
    index
        .add_document("toko-y", DOC_TYPE_FAQ, "1", "ongkir gratis jakarta", Map::new())
        .await
        .unwrap();

    let hits = index.search("toko-x", "ongkir jakarta", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_id, "1");
    assert_eq!(hits[0].doc_type, DOC_TYPE_FAQ);
    assert_eq!(index.count("toko-y").await.unwrap(), 1);
}

#[tokio::test]
async fn search_results_are_ordered_by_score() {
    let index = memory_retriever().await;
    index
        .add_document("toko-x", "note", "a", "kopi susu gula aren", Map::new())
        .await
        .unwrap();
    index
        .add_document("toko-x", "note", "b", "kopi", Map::new())
        .await
        .unwrap();
    index
        .add_document("toko-x", "note", "c", "teh manis", Map::new())
        .await
        .unwrap();

    let hits = index.search("toko-x", "kopi susu gula aren", 3).await.unwrap();
    assert_eq!(hits[0].doc_id, "a");
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn search_by_type_filters_document_type() {
    let index = memory_retriever().await;
    index
        .add_document("toko-x", DOC_TYPE_FAQ, "1", "kopi susu", Map::new())
        .await
        .unwrap();
    index
        .add_document(
            "toko-x",
            DOC_TYPE_PRODUCT,
            "2",
            "kopi susu",
            meta(json!({"name": "Kopi Susu", "price": 18000})),
        )
        .await
        .unwrap();

    let hits = index
        .search_by_type("toko-x", DOC_TYPE_PRODUCT, "kopi", 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_type, DOC_TYPE_PRODUCT);
    assert_eq!(hits[0].metadata["name"], "Kopi Susu");
}

#[tokio::test]
async fn chunked_documents_carry_provenance_and_replace_stale_chunks() {
    let index = memory_retriever().await;
    let long = "Pengiriman dilakukan setiap hari kerja. Pesanan sebelum jam dua siang dikirim hari yang sama. Ongkir gratis untuk Jakarta.";
    let chunks = index
        .add_document_chunked("toko-x", "policy", "shipping", long, meta(json!({"lang": "id"})))
        .await
        .unwrap();
    assert!(chunks > 1);
    assert_eq!(index.count("toko-x").await.unwrap(), chunks);

    let hits = index.search("toko-x", "ongkir gratis jakarta", 10).await.unwrap();
    assert_eq!(hits.len(), chunks);
    for hit in &hits {
        assert_eq!(hit.metadata["parent_id"], "shipping");
        assert_eq!(hit.metadata["total_chunks"], json!(chunks));
        assert_eq!(hit.metadata["lang"], "id");
        let chunk_index = hit.metadata["chunk_index"].as_u64().unwrap();
        assert_eq!(hit.doc_id, format!("shipping#{chunk_index}"));
    }

    let shorter = index
        .add_document_chunked("toko-x", "policy", "shipping", "Ongkir gratis.", Map::new())
        .await
        .unwrap();
    assert_eq!(shorter, 1);
    assert_eq!(index.count("toko-x").await.unwrap(), 1);
}

#[tokio::test]
async fn delete_document_and_delete_tenant() {
    let index = memory_retriever().await;
    let long = "a b c d e f g h i j k l m n o p q r s t u v w x y z a b c d e f g h i j";
    index
        .add_document_chunked("toko-x", "note", "alphabet", long, Map::new())
        .await
        .unwrap();
    index
        .add_document("toko-x", DOC_TYPE_FAQ, "1", "jam buka", Map::new())
        .await
        .unwrap();
    index
        .add_document("toko-y", DOC_TYPE_FAQ, "1", "jam buka", Map::new())
        .await
        .unwrap();

    index.delete_document("toko-x", "note", "alphabet").await.unwrap();
    assert_eq!(index.count("toko-x").await.unwrap(), 1);

    index.delete_tenant("toko-x").await.unwrap();
    assert_eq!(index.count("toko-x").await.unwrap(), 0);
    assert_eq!(index.count("toko-y").await.unwrap(), 1);
}

/// Returns canned hits regardless of the query.
struct CannedStore {
    hits: Vec<ScoredPoint>,
}

#[async_trait]
impl VectorStore for CannedStore {
    fn backend_name(&self) -> &'static str {
        "canned"
    }

    async fn ensure_collection(
        &self,
        spec: &CollectionSpec,
    ) -> Result<CollectionInfo, VectorError> {
        Ok(CollectionInfo {
            name: spec.name.clone(),
            dimension: Some(spec.dimension),
            points_count: Some(self.hits.len()),
            created: false,
        })
    }

    async fn upsert(
        &self,
        _collection: &str,
        _points: Vec<VectorPoint>,
    ) -> Result<(), VectorError> {
        Ok(())
    }

    async fn search(
        &self,
        _collection: &str,
        _vector: &[f32],
        _filter: &Filter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        Ok(self.hits.iter().take(limit).cloned().collect())
    }

    async fn delete_by_filter(
        &self,
        _collection: &str,
        _filter: &Filter,
    ) -> Result<(), VectorError> {
        Ok(())
    }

    async fn count(&self, _collection: &str, _filter: &Filter) -> Result<usize, VectorError> {
        Ok(self.hits.len())
    }
}

fn canned(score: f32, doc_type: &str, text: &str, metadata: Value) -> ScoredPoint {
    ScoredPoint {
        id: format!("{doc_type}-{score}"),
        score,
        payload: meta(json!({
            "client_id": "toko-x",
            "doc_type": doc_type,
            "doc_id": "d",
            "text": text,
            "metadata": metadata,
        })),
    }
}

fn canned_retriever(hits: Vec<ScoredPoint>) -> VectorRetriever {
    retriever(
        Arc::new(CannedStore { hits }),
        ChunkSettings {
            size: 1000,
            overlap: 200,
        },
    )
}

#[tokio::test]
async fn relevant_context_applies_threshold_and_score_order() {
    let index = canned_retriever(vec![
        canned(
            0.80,
            DOC_TYPE_FAQ,
            "",
            json!({"question": "Ongkir?", "answer": "Gratis se-Jakarta"}),
        ),
        canned(
            0.95,
            DOC_TYPE_PRODUCT,
            "",
            json!({"name": "Kopi Susu", "description": "Es kopi susu gula aren", "price": 18000}),
        ),
        canned(0.50, "promo", "Diskon kemarin", Value::Null),
    ]);

    let context = index.get_relevant_context("toko-x", "kopi", 5).await.unwrap();

    let product = context.find("[Product] Kopi Susu").unwrap();
    let faq = context.find("Q: Ongkir?").unwrap();
    assert!(product < faq);
    assert!(context.contains("Price: Rp 18000"));
    assert!(!context.contains("Diskon kemarin"));
}

#[tokio::test]
async fn relevant_context_is_empty_below_threshold() {
    let index = canned_retriever(vec![canned(0.69, "promo", "Diskon", Value::Null)]);
    assert_eq!(index.get_relevant_context("toko-x", "promo", 5).await.unwrap(), "");
}

#[tokio::test]
async fn semantic_retriever_builds_snapshot_from_profile_and_context() {
    let store = toko_x_store().await;
    let index = Arc::new(canned_retriever(vec![canned(
        0.9,
        "hours",
        "Buka 08:00-17:00",
        Value::Null,
    )]));
    let semantic = SemanticRetriever::new(store, index, 5);

    let tenant: TenantContext = tenant("toko-x", "customer_service");
    let snapshot = semantic.retrieve(&tenant, "jam buka").await.unwrap();

    assert_eq!(snapshot.business_name, "Toko X");
    assert_eq!(snapshot.tone, "ramah");
    assert!(snapshot.faqs.is_empty());
    assert!(snapshot.relevant_context.contains("[hours] (relevance 0.90)"));
    assert_eq!(semantic.strategy(), "vector");
}

#[tokio::test]
async fn structured_knowledge_can_be_indexed() {
    let store = toko_x_store().await;
    let index = retriever(
        Arc::new(MemoryVectorStore::default()),
        ChunkSettings {
            size: 1000,
            overlap: 200,
        },
    );
    index.ensure_collection().await.unwrap();

    let points = index_tenant_knowledge(&store, &index, "toko-x").await.unwrap();

    assert_eq!(points, 2);
    let faqs = index
        .search_by_type("toko-x", DOC_TYPE_FAQ, "jam buka", 5)
        .await
        .unwrap();
    assert_eq!(faqs[0].metadata["answer"], "Setiap hari 08:00-17:00");
}

#[tokio::test]
async fn dimension_mismatch_is_rejected() {
    let store = MemoryVectorStore::default();
    store
        .ensure_collection(&CollectionSpec {
            name: "kb".to_string(),
            dimension: 3,
            distance: Distance::Cosine,
        })
        .await
        .unwrap();
    let err = store
        .upsert(
            "kb",
            vec![VectorPoint {
                id: "p".to_string(),
                vector: vec![1.0, 0.0],
                payload: Map::new(),
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VectorError::Dimension { expected: 3, actual: 2, .. }));
}

/// Keyword embedder that can be switched into failing mid-test.
struct FlakyEmbedder {
    inner: Arc<KeywordEmbedder>,
    failing: AtomicBool,
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn provider_name(&self) -> &str {
        "flaky"
    }

    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dimension(&self) -> usize {
        self.inner.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Transport("connection refused".to_string()));
        }
        self.inner.embed(text).await
    }
}

#[tokio::test]
async fn failed_update_keeps_the_previous_version() {
    let embedder = Arc::new(FlakyEmbedder {
        inner: KeywordEmbedder::new(DIM),
        failing: AtomicBool::new(false),
    });
    let index = VectorRetriever::new(
        Arc::new(MemoryVectorStore::default()),
        embedder.clone(),
        "knowledge_base",
        0.7,
        ChunkSettings {
            size: 1000,
            overlap: 200,
        },
    );
    index.ensure_collection().await.unwrap();
    index
        .add_document_chunked("toko-x", "policy", "d1", "Retur maksimal 3 hari.", Map::new())
        .await
        .unwrap();
    assert_eq!(index.count("toko-x").await.unwrap(), 1);

    embedder.failing.store(true, Ordering::SeqCst);
    let update = index
        .add_document_chunked("toko-x", "policy", "d1", "Retur maksimal 7 hari.", Map::new())
        .await;
    assert!(matches!(update, Err(VectorError::Embedding(_))));
    assert_eq!(index.count("toko-x").await.unwrap(), 1);

    embedder.failing.store(false, Ordering::SeqCst);
    let hits = index.search("toko-x", "retur", 5).await.unwrap();
    assert_eq!(hits[0].text, "Retur maksimal 3 hari.");
}

#[tokio::test]
async fn chunked_document_replaces_an_unchunked_one() {
    let index = memory_retriever().await;
    index
        .add_document("toko-x", "policy", "d1", "Retur 3 hari.", Map::new())
        .await
        .unwrap();
    index
        .add_document_chunked("toko-x", "policy", "d1", "Retur 7 hari.", Map::new())
        .await
        .unwrap();

    let hits = index.search("toko-x", "retur", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_id, "d1#0");
}

#[tokio::test]
async fn reindexing_drops_knowledge_removed_from_the_store() {
    let store = toko_x_store().await;
    let index = retriever(
        Arc::new(MemoryVectorStore::default()),
        ChunkSettings {
            size: 1000,
            overlap: 200,
        },
    );
    index.ensure_collection().await.unwrap();
    index_tenant_knowledge(&store, &index, "toko-x").await.unwrap();
    index
        .add_document_chunked("toko-x", "promo", "ramadan", "Diskon Ramadan.", Map::new())
        .await
        .unwrap();
    assert_eq!(index.count("toko-x").await.unwrap(), 3);

    store.clear_knowledge("toko-x").await.unwrap();
    store
        .add_faq(
            "toko-x",
            Faq {
                question: "Bisa COD?".to_string(),
                answer: "Bisa untuk Jakarta.".to_string(),
            },
        )
        .await
        .unwrap();
    let points = index_tenant_knowledge(&store, &index, "toko-x").await.unwrap();

    assert_eq!(points, 1);
    assert_eq!(index.count("toko-x").await.unwrap(), 2);
    let products = index
        .search_by_type("toko-x", DOC_TYPE_PRODUCT, "kopi susu", 5)
        .await
        .unwrap();
    assert!(products.is_empty());
    let faqs = index
        .search_by_type("toko-x", DOC_TYPE_FAQ, "cod", 5)
        .await
        .unwrap();
    assert_eq!(faqs.len(), 1);
    assert_eq!(faqs[0].metadata["answer"], "Bisa untuk Jakarta.");
    let promos = index.search_by_type("toko-x", "promo", "diskon", 5).await.unwrap();
    assert_eq!(promos.len(), 1);
}
