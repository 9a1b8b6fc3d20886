use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const API_VERSION: &str = "1.0.0";

pub const DOC_TYPE_FAQ: &str = "faq";
pub const DOC_TYPE_PRODUCT: &str = "product";

/// Payload key every vector point is scoped by.
pub const TENANT_PAYLOAD_KEY: &str = "client_id";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingEvent {
    pub sender_id: String,
    pub text: String,
    /// Server clock at ingress. The cooldown gate only ever reads this.
    pub received_at: DateTime<Utc>,
    /// Timestamp reported by the messaging client, kept for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl IncomingEvent {
    pub fn new(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            text: text.into(),
            received_at: Utc::now(),
            sent_at: None,
        }
    }

    /// Override the arrival time. Replay and tests only; ingress always uses `new`.
    pub fn at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn with_sent_at(mut self, sent_at: Option<DateTime<Utc>>) -> Self {
        self.sent_at = sent_at;
        self
    }
}

/// Resolved once per event. Either every field is present or resolution failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TenantContext {
    pub module: String,
    pub role: String,
    pub company_id: String,
    pub client_id: String,
}

impl TenantContext {
    /// Knowledge, vector points and conversation records are keyed by the client id.
    pub fn tenant_id(&self) -> &str {
        &self.client_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Faq {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub name: String,
    pub price: f64,
}

/// Free-form typed knowledge such as opening hours, policies or promos.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub title: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeSnapshot {
    pub business_name: String,
    pub tone: String,
    #[serde(default)]
    pub faqs: Vec<Faq>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub entries: Vec<KnowledgeEntry>,
    /// Pre-formatted semantic search block; empty under structured retrieval.
    #[serde(default)]
    pub relevant_context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub score: f32,
    pub text: String,
    pub doc_type: String,
    pub doc_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationRecord {
    pub tenant_id: String,
    pub sender_id: String,
    pub request_text: String,
    pub response_text: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(tenant_id: &str, sender_id: &str, request_text: &str, response_text: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            sender_id: sender_id.to_string(),
            request_text: request_text.to_string(),
            response_text: response_text.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Distance {
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionSpec {
    pub name: String,
    pub dimension: usize,
    pub distance: Distance,
}

/// Boolean combination of payload conditions, shaped like the Qdrant REST filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub should: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must_not: Vec<Condition>,
}

impl Filter {
    pub fn tenant(tenant_id: &str) -> Self {
        Self {
            must: vec![Condition::matches(TENANT_PAYLOAD_KEY, tenant_id)],
            ..Self::default()
        }
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.must.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.should.is_empty() && self.must_not.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub key: String,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_value: Option<MatchValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

impl Condition {
    pub fn matches(key: &str, value: impl Into<Value>) -> Self {
        Self {
            key: key.to_string(),
            match_value: Some(MatchValue {
                value: value.into(),
            }),
            range: None,
        }
    }

    pub fn in_range(key: &str, range: Range) -> Self {
        Self {
            key: key.to_string(),
            match_value: None,
            range: Some(range),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchValue {
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Range {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
}
