use concierge_contracts::{Condition, Filter, Range};
use serde_json::{Map, Value};

/// Cosine similarity of two vectors. Mismatched lengths or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Evaluate a filter against a point payload with Qdrant semantics: every `must`
/// holds, at least one `should` holds (when any are given), no `must_not` holds.
pub fn filter_matches(filter: &Filter, payload: &Map<String, Value>) -> bool {
    filter.must.iter().all(|c| condition_matches(c, payload))
        && (filter.should.is_empty() || filter.should.iter().any(|c| condition_matches(c, payload)))
        && !filter.must_not.iter().any(|c| condition_matches(c, payload))
}

fn condition_matches(condition: &Condition, payload: &Map<String, Value>) -> bool {
    let Some(field) = lookup(payload, &condition.key) else {
        return false;
    };
    if let Some(expected) = &condition.match_value {
        let hit = match field {
            Value::Array(items) => items.iter().any(|v| *v == expected.value),
            other => *other == expected.value,
        };
        if !hit {
            return false;
        }
    }
    if let Some(range) = &condition.range {
        match field.as_f64() {
            Some(n) if in_range(n, range) => {}
            _ => return false,
        }
    }
    true
}

fn in_range(n: f64, range: &Range) -> bool {
    range.gte.map_or(true, |b| n >= b)
        && range.gt.map_or(true, |b| n > b)
        && range.lte.map_or(true, |b| n <= b)
        && range.lt.map_or(true, |b| n < b)
}

fn lookup<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}
