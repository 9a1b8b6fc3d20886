mod chunk;
mod gate;
mod prompt;
mod routing;
mod vector;

pub use chunk::{chunk_text, TextChunk};
pub use gate::{CooldownGate, GateDecision};
pub use prompt::{build_system_prompt, format_relevant_context, BEHAVIOR_INSTRUCTIONS};
pub use routing::{DispatchTable, HandlerKind, ModuleKind, Route, RouteReason};
pub use vector::{cosine_similarity, filter_matches};

use sha2::{Digest, Sha256};

/// Deterministic key for a document inside the vector index.
///
/// The same (tenant, type, id) triple always yields the same key, so repeated writes
/// overwrite one point instead of accumulating duplicates.
pub fn point_key(tenant_id: &str, doc_type: &str, doc_id: &str) -> String {
    format!("{tenant_id}_{doc_type}_{doc_id}")
}

/// UUID-formatted point id derived from [`point_key`]. Qdrant only accepts UUIDs or
/// unsigned integers as point ids.
pub fn point_id(tenant_id: &str, doc_type: &str, doc_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(point_key(tenant_id, doc_type, doc_id).as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub fn chunk_doc_id(parent_id: &str, chunk_index: usize) -> String {
    format!("{parent_id}#{chunk_index}")
}
