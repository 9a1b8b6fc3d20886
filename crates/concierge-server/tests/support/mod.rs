#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::Router;
use concierge_config::OverflowPolicy;
use concierge_contracts::{ConversationRecord, Faq, Product, TenantContext};
use concierge_server::{
    BusinessProfile, ConversationLogger, ConversationSink, DispatchError, EmbeddingError,
    EmbeddingProvider, Engine, EngineParts, EngineSettings, GenerationError, GenerationProvider,
    KnowledgeRetriever, KnowledgeStore, LogError, ReplyDispatcher, StructuredRetriever,
};
use tokio_util::sync::CancellationToken;

pub const APOLOGY: &str = "Maaf, sistem sedang gangguan.";
pub const FALLBACK: &str = "Maaf, belum bisa menjawab.";

pub fn temp_path(name: &str, ext: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    std::env::temp_dir()
        .join(format!("concierge-{name}-{nanos}.{ext}"))
        .to_string_lossy()
        .to_string()
}

pub async fn spawn_mock(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn tenant(client_id: &str, module: &str) -> TenantContext {
    TenantContext {
        module: module.to_string(),
        role: "customer".to_string(),
        company_id: "company-1".to_string(),
        client_id: client_id.to_string(),
    }
}

/// Toko X with one FAQ about opening hours and one product, reachable from sender 6281.
pub async fn toko_x_store() -> Arc<KnowledgeStore> {
    let store = Arc::new(KnowledgeStore::memory());
    store
        .register_sender("6281", tenant("toko-x", "customer_service"))
        .await
        .unwrap();
    store
        .upsert_profile(
            "toko-x",
            BusinessProfile {
                business_name: "Toko X".to_string(),
                tone: "ramah".to_string(),
            },
        )
        .await
        .unwrap();
    store
        .add_faq(
            "toko-x",
            Faq {
                question: "Jam buka?".to_string(),
                answer: "Setiap hari 08:00-17:00".to_string(),
            },
        )
        .await
        .unwrap();
    store
        .add_product(
            "toko-x",
            Product {
                name: "Kopi Susu".to_string(),
                price: 18000.0,
            },
        )
        .await
        .unwrap();
    store
}

pub enum Script {
    Reply(String),
    Fail,
    Blank,
    /// Sleeps far past any test deadline unless cancelled.
    Hang,
}

/// Generation provider that records every prompt it sees.
pub struct ScriptedProvider {
    script: Script,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedProvider {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(vec![]),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_system_prompt(&self) -> String {
        self.prompts
            .lock()
            .unwrap()
            .last()
            .map(|(system, _)| system.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn generate_response(
        &self,
        cancel: &CancellationToken,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_message.to_string()));
        match &self.script {
            Script::Reply(text) => Ok(text.clone()),
            Script::Fail => Err(GenerationError::Api {
                status: 503,
                body: "overloaded".to_string(),
            }),
            Script::Blank => Ok("   ".to_string()),
            Script::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(GenerationError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok("too late".to_string()),
                }
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    pub fail: bool,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            sent: Mutex::new(vec![]),
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyDispatcher for RecordingDispatcher {
    async fn send_reply(&self, sender_id: &str, text: &str) -> Result<(), DispatchError> {
        if self.fail {
            return Err(DispatchError::Transport("gateway unreachable".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((sender_id.to_string(), text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<ConversationRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<ConversationRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationSink for RecordingSink {
    async fn log_conversation(&self, record: &ConversationRecord) -> Result<(), LogError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Bag-of-words embedding: each token adds weight to one of `dimension` buckets.
pub struct KeywordEmbedder {
    pub dimension: usize,
}

impl KeywordEmbedder {
    pub fn new(dimension: usize) -> Arc<Self> {
        Arc::new(Self { dimension })
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn provider_name(&self) -> &str {
        "keyword"
    }

    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in token.to_lowercase().bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            vector[(hash % self.dimension as u64) as usize] += 1.0;
        }
        Ok(vector)
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub provider: Arc<ScriptedProvider>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub sink: Arc<RecordingSink>,
    pub logger: Arc<ConversationLogger>,
}

/// Default engine configuration with short texts and the given generation deadline.
pub fn settings(timeout: Duration) -> EngineSettings {
    EngineSettings {
        generation_timeout: timeout,
        apology_text: APOLOGY.to_string(),
        fallback_text: FALLBACK.to_string(),
        ..EngineSettings::from(&concierge_config::Engine::default())
    }
}

pub fn harness_with(
    store: Arc<KnowledgeStore>,
    retriever: Arc<dyn KnowledgeRetriever>,
    provider: Arc<ScriptedProvider>,
    dispatcher: Arc<RecordingDispatcher>,
    timeout: Duration,
) -> Harness {
    let sink = Arc::new(RecordingSink::default());
    let logger = Arc::new(ConversationLogger::start(
        sink.clone(),
        16,
        2,
        OverflowPolicy::Reject,
    ));
    let engine = Engine::new(
        settings(timeout),
        EngineParts {
            resolver: store,
            retriever,
            provider: provider.clone(),
            dispatcher: dispatcher.clone(),
            logger: logger.clone(),
        },
    );
    Harness {
        engine: Arc::new(engine),
        provider,
        dispatcher,
        sink,
        logger,
    }
}

pub fn harness(
    store: Arc<KnowledgeStore>,
    provider: Arc<ScriptedProvider>,
    dispatcher: Arc<RecordingDispatcher>,
) -> Harness {
    let retriever = Arc::new(StructuredRetriever::new(store.clone(), 50, 100));
    harness_with(store, retriever, provider, dispatcher, Duration::from_secs(5))
}

/// Poll until `check` holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
