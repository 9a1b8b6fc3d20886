use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use concierge_contracts::{
    Faq, KnowledgeEntry, KnowledgeSnapshot, Product, TenantContext, DOC_TYPE_FAQ,
    DOC_TYPE_PRODUCT,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{RetrievalError, StoreError};

/// Upper bound on free-form entries placed in one snapshot.
pub const ENTRY_LIMIT: usize = 50;

/// Maps a sender to the tenant that owns the conversation.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve_tenant(&self, sender_id: &str) -> Result<TenantContext, StoreError>;
}

/// Produces the knowledge a reply is grounded on.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    fn strategy(&self) -> &'static str;

    async fn retrieve(
        &self,
        tenant: &TenantContext,
        query: &str,
    ) -> Result<KnowledgeSnapshot, RetrievalError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub business_name: String,
    #[serde(default)]
    pub tone: String,
}

/// A unit of tenant knowledge ready to be embedded into the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeDocument {
    pub doc_type: String,
    pub doc_id: String,
    pub text: String,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub tenants: Vec<SeedTenant>,
}

#[derive(Debug, Deserialize)]
pub struct SeedTenant {
    pub client_id: String,
    pub company_id: String,
    pub business_name: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default = "default_module")]
    pub module: String,
    #[serde(default)]
    pub senders: Vec<SeedSender>,
    #[serde(default)]
    pub faqs: Vec<Faq>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub entries: Vec<KnowledgeEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SeedSender {
    pub sender_id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_module() -> String {
    "customer_service".to_string()
}

fn default_role() -> String {
    "customer".to_string()
}

/// Tenant directory and per-tenant knowledge, in memory or in SQLite.
pub struct KnowledgeStore {
    backend: Mutex<StoreBackend>,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
struct MemoryStore {
    senders: HashMap<String, TenantContext>,
    profiles: HashMap<String, BusinessProfile>,
    faqs: HashMap<String, Vec<Faq>>,
    products: HashMap<String, Vec<Product>>,
    entries: HashMap<String, Vec<KnowledgeEntry>>,
}

struct SqliteStore {
    conn: Connection,
}

impl KnowledgeStore {
    pub fn memory() -> Self {
        Self {
            backend: Mutex::new(StoreBackend::Memory(MemoryStore::default())),
        }
    }

    pub fn sqlite(path: &str) -> Result<Self, StoreError> {
        Ok(Self {
            backend: Mutex::new(StoreBackend::Sqlite(SqliteStore::new(path)?)),
        })
    }

    pub async fn register_sender(
        &self,
        sender_id: &str,
        tenant: TenantContext,
    ) -> Result<(), StoreError> {
        let mut backend = self.backend.lock().await;
        match &mut *backend {
            StoreBackend::Memory(store) => {
                store.senders.insert(sender_id.to_string(), tenant);
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.register_sender(sender_id, &tenant),
        }
    }

    pub async fn upsert_profile(
        &self,
        client_id: &str,
        profile: BusinessProfile,
    ) -> Result<(), StoreError> {
        let mut backend = self.backend.lock().await;
        match &mut *backend {
            StoreBackend::Memory(store) => {
                store.profiles.insert(client_id.to_string(), profile);
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.upsert_profile(client_id, &profile),
        }
    }

    pub async fn add_faq(&self, client_id: &str, faq: Faq) -> Result<(), StoreError> {
        let mut backend = self.backend.lock().await;
        match &mut *backend {
            StoreBackend::Memory(store) => {
                store.faqs.entry(client_id.to_string()).or_default().push(faq);
                Ok(())
            }
            StoreBackend::Sqlite(store) => {
                store.conn.execute(
                    "INSERT INTO faqs(client_id, question, answer) VALUES (?1, ?2, ?3)",
                    params![client_id, faq.question, faq.answer],
                )?;
                Ok(())
            }
        }
    }

    pub async fn add_product(&self, client_id: &str, product: Product) -> Result<(), StoreError> {
        let mut backend = self.backend.lock().await;
        match &mut *backend {
            StoreBackend::Memory(store) => {
                store
                    .products
                    .entry(client_id.to_string())
                    .or_default()
                    .push(product);
                Ok(())
            }
            StoreBackend::Sqlite(store) => {
                store.conn.execute(
                    "INSERT INTO products(client_id, name, price) VALUES (?1, ?2, ?3)",
                    params![client_id, product.name, product.price],
                )?;
                Ok(())
            }
        }
    }

    pub async fn add_entry(
        &self,
        client_id: &str,
        entry: KnowledgeEntry,
    ) -> Result<(), StoreError> {
        let mut backend = self.backend.lock().await;
        match &mut *backend {
            StoreBackend::Memory(store) => {
                store
                    .entries
                    .entry(client_id.to_string())
                    .or_default()
                    .push(entry);
                Ok(())
            }
            StoreBackend::Sqlite(store) => {
                let content = serde_json::to_string(&entry.content)?;
                store.conn.execute(
                    "INSERT INTO knowledge_entries(client_id, entry_type, title, content_json)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![client_id, entry.entry_type, entry.title, content],
                )?;
                Ok(())
            }
        }
    }

    /// Remove FAQs, products and entries of a tenant. Profile and senders stay.
    pub async fn clear_knowledge(&self, client_id: &str) -> Result<(), StoreError> {
        let mut backend = self.backend.lock().await;
        match &mut *backend {
            StoreBackend::Memory(store) => {
                store.faqs.remove(client_id);
                store.products.remove(client_id);
                store.entries.remove(client_id);
                Ok(())
            }
            StoreBackend::Sqlite(store) => {
                let tx = store.conn.transaction()?;
                tx.execute("DELETE FROM faqs WHERE client_id = ?1", params![client_id])?;
                tx.execute("DELETE FROM products WHERE client_id = ?1", params![client_id])?;
                tx.execute(
                    "DELETE FROM knowledge_entries WHERE client_id = ?1",
                    params![client_id],
                )?;
                tx.commit()?;
                Ok(())
            }
        }
    }

    pub async fn load_seed(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::Seed(format!("{path}: {e}")))?;
        let seed: Seed =
            serde_yaml::from_str(&text).map_err(|e| StoreError::Seed(format!("{path}: {e}")))?;
        self.apply_seed(seed).await
    }

    /// Install a seed. Knowledge of every seeded tenant is replaced, not appended, so
    /// restarting against the same SQLite file does not duplicate rows.
    pub async fn apply_seed(&self, seed: Seed) -> Result<Vec<String>, StoreError> {
        let mut tenants = Vec::with_capacity(seed.tenants.len());
        for tenant in seed.tenants {
            self.upsert_profile(
                &tenant.client_id,
                BusinessProfile {
                    business_name: tenant.business_name,
                    tone: tenant.tone,
                },
            )
            .await?;
            for sender in &tenant.senders {
                self.register_sender(
                    &sender.sender_id,
                    TenantContext {
                        module: tenant.module.clone(),
                        role: sender.role.clone(),
                        company_id: tenant.company_id.clone(),
                        client_id: tenant.client_id.clone(),
                    },
                )
                .await?;
            }
            self.clear_knowledge(&tenant.client_id).await?;
            for faq in tenant.faqs {
                self.add_faq(&tenant.client_id, faq).await?;
            }
            for product in tenant.products {
                self.add_product(&tenant.client_id, product).await?;
            }
            for entry in tenant.entries {
                self.add_entry(&tenant.client_id, entry).await?;
            }
            info!(
                client_id = %tenant.client_id,
                senders = tenant.senders.len(),
                "tenant seeded"
            );
            tenants.push(tenant.client_id);
        }
        Ok(tenants)
    }

    pub async fn business_profile(&self, client_id: &str) -> Result<BusinessProfile, StoreError> {
        let backend = self.backend.lock().await;
        match &*backend {
            StoreBackend::Memory(store) => store
                .profiles
                .get(client_id)
                .cloned()
                .ok_or_else(|| StoreError::UnknownTenant(client_id.to_string())),
            StoreBackend::Sqlite(store) => store.business_profile(client_id),
        }
    }

    /// Business profile, FAQs, products and entries of one tenant, read under a single
    /// lock. FAQs and products are capped at the given limits in insertion order.
    pub async fn snapshot(
        &self,
        client_id: &str,
        faq_limit: usize,
        product_limit: usize,
    ) -> Result<KnowledgeSnapshot, StoreError> {
        let backend = self.backend.lock().await;
        match &*backend {
            StoreBackend::Memory(store) => {
                let profile = store
                    .profiles
                    .get(client_id)
                    .ok_or_else(|| StoreError::UnknownTenant(client_id.to_string()))?;
                Ok(KnowledgeSnapshot {
                    business_name: profile.business_name.clone(),
                    tone: profile.tone.clone(),
                    faqs: take_cloned(store.faqs.get(client_id), faq_limit),
                    products: take_cloned(store.products.get(client_id), product_limit),
                    entries: take_cloned(store.entries.get(client_id), ENTRY_LIMIT),
                    relevant_context: String::new(),
                })
            }
            StoreBackend::Sqlite(store) => {
                let profile = store.business_profile(client_id)?;
                Ok(KnowledgeSnapshot {
                    business_name: profile.business_name,
                    tone: profile.tone,
                    faqs: store.faqs(client_id, faq_limit)?,
                    products: store.products(client_id, product_limit)?,
                    entries: store.entries(client_id, ENTRY_LIMIT)?,
                    relevant_context: String::new(),
                })
            }
        }
    }

    /// Every FAQ, product and entry of a tenant as indexable documents.
    pub async fn documents(&self, client_id: &str) -> Result<Vec<KnowledgeDocument>, StoreError> {
        let snapshot = self.snapshot(client_id, usize::MAX, usize::MAX).await?;
        let mut docs = Vec::new();
        for (i, faq) in snapshot.faqs.into_iter().enumerate() {
            docs.push(KnowledgeDocument {
                doc_type: DOC_TYPE_FAQ.to_string(),
                doc_id: format!("faq-{}", i + 1),
                text: format!("Q: {}\nA: {}", faq.question, faq.answer),
                metadata: object(json!({"question": faq.question, "answer": faq.answer})),
            });
        }
        for (i, product) in snapshot.products.into_iter().enumerate() {
            docs.push(KnowledgeDocument {
                doc_type: DOC_TYPE_PRODUCT.to_string(),
                doc_id: format!("product-{}", i + 1),
                text: product.name.clone(),
                metadata: object(json!({"name": product.name, "price": product.price})),
            });
        }
        for (i, entry) in snapshot.entries.into_iter().enumerate() {
            let body = match &entry.content {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            docs.push(KnowledgeDocument {
                doc_type: entry.entry_type.clone(),
                doc_id: format!("entry-{}", i + 1),
                text: format!("{}\n{body}", entry.title),
                metadata: object(json!({"title": entry.title})),
            });
        }
        Ok(docs)
    }
}

#[async_trait]
impl TenantResolver for KnowledgeStore {
    async fn resolve_tenant(&self, sender_id: &str) -> Result<TenantContext, StoreError> {
        let tenant = {
            let backend = self.backend.lock().await;
            match &*backend {
                StoreBackend::Memory(store) => store.senders.get(sender_id).cloned(),
                StoreBackend::Sqlite(store) => store.tenant_for(sender_id)?,
            }
        };
        let tenant = tenant.ok_or_else(|| StoreError::UnknownSender(sender_id.to_string()))?;
        ensure_complete(sender_id, &tenant)?;
        debug!(
            sender_id,
            client_id = %tenant.client_id,
            module = %tenant.module,
            "tenant resolved"
        );
        Ok(tenant)
    }
}

fn ensure_complete(sender_id: &str, tenant: &TenantContext) -> Result<(), StoreError> {
    let fields = [
        ("module", &tenant.module),
        ("role", &tenant.role),
        ("company_id", &tenant.company_id),
        ("client_id", &tenant.client_id),
    ];
    for (field, value) in fields {
        if value.trim().is_empty() {
            return Err(StoreError::IncompleteTenant {
                sender_id: sender_id.to_string(),
                field,
            });
        }
    }
    Ok(())
}

fn take_cloned<T: Clone>(items: Option<&Vec<T>>, limit: usize) -> Vec<T> {
    items
        .map(|v| v.iter().take(limit).cloned().collect())
        .unwrap_or_default()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenants (
                sender_id TEXT PRIMARY KEY,
                module TEXT NOT NULL,
                role TEXT NOT NULL,
                company_id TEXT NOT NULL,
                client_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS business_profiles (
                client_id TEXT PRIMARY KEY,
                business_name TEXT NOT NULL,
                tone TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS faqs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                name TEXT NOT NULL,
                price REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS knowledge_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                title TEXT NOT NULL,
                content_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS faqs_client ON faqs(client_id);
            CREATE INDEX IF NOT EXISTS products_client ON products(client_id);
            CREATE INDEX IF NOT EXISTS entries_client ON knowledge_entries(client_id);
            ",
        )?;
        Ok(Self { conn })
    }

    fn register_sender(
        &mut self,
        sender_id: &str,
        tenant: &TenantContext,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO tenants(sender_id, module, role, company_id, client_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sender_id,
                tenant.module,
                tenant.role,
                tenant.company_id,
                tenant.client_id
            ],
        )?;
        Ok(())
    }

    fn upsert_profile(
        &mut self,
        client_id: &str,
        profile: &BusinessProfile,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO business_profiles(client_id, business_name, tone) VALUES (?1, ?2, ?3)
             ON CONFLICT(client_id) DO UPDATE SET
                business_name = excluded.business_name,
                tone = excluded.tone",
            params![client_id, profile.business_name, profile.tone],
        )?;
        Ok(())
    }

    fn tenant_for(&self, sender_id: &str) -> Result<Option<TenantContext>, StoreError> {
        let tenant = self
            .conn
            .query_row(
                "SELECT module, role, company_id, client_id FROM tenants WHERE sender_id = ?1",
                params![sender_id],
                |row| {
                    Ok(TenantContext {
                        module: row.get(0)?,
                        role: row.get(1)?,
                        company_id: row.get(2)?,
                        client_id: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }

    fn business_profile(&self, client_id: &str) -> Result<BusinessProfile, StoreError> {
        self.conn
            .query_row(
                "SELECT business_name, tone FROM business_profiles WHERE client_id = ?1",
                params![client_id],
                |row| {
                    Ok(BusinessProfile {
                        business_name: row.get(0)?,
                        tone: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownTenant(client_id.to_string()))
    }

    fn faqs(&self, client_id: &str, limit: usize) -> Result<Vec<Faq>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT question, answer FROM faqs WHERE client_id = ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![client_id, sql_limit(limit)], |row| {
            Ok(Faq {
                question: row.get(0)?,
                answer: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn products(&self, client_id: &str, limit: usize) -> Result<Vec<Product>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, price FROM products WHERE client_id = ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![client_id, sql_limit(limit)], |row| {
            Ok(Product {
                name: row.get(0)?,
                price: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn entries(&self, client_id: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_type, title, content_json FROM knowledge_entries
             WHERE client_id = ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![client_id, sql_limit(limit)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (entry_type, title, content_json) = row?;
            entries.push(KnowledgeEntry {
                entry_type,
                title,
                content: serde_json::from_str(&content_json)?,
            });
        }
        Ok(entries)
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Retrieval straight from the relational store: business profile plus capped FAQ
/// and product lists.
pub struct StructuredRetriever {
    store: Arc<KnowledgeStore>,
    faq_limit: usize,
    product_limit: usize,
}

impl StructuredRetriever {
    pub fn new(store: Arc<KnowledgeStore>, faq_limit: usize, product_limit: usize) -> Self {
        Self {
            store,
            faq_limit,
            product_limit,
        }
    }
}

#[async_trait]
impl KnowledgeRetriever for StructuredRetriever {
    fn strategy(&self) -> &'static str {
        "structured"
    }

    async fn retrieve(
        &self,
        tenant: &TenantContext,
        _query: &str,
    ) -> Result<KnowledgeSnapshot, RetrievalError> {
        Ok(self
            .store
            .snapshot(tenant.tenant_id(), self.faq_limit, self.product_limit)
            .await?)
    }
}
