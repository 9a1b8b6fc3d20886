use std::fmt::Write;

use concierge_contracts::{KnowledgeSnapshot, SearchResult, DOC_TYPE_FAQ, DOC_TYPE_PRODUCT};
use serde_json::Value;

pub const BEHAVIOR_INSTRUCTIONS: &str = "\
Instructions:
- Be friendly, warm and polite. Reply in the language the customer writes in.
- If the question is unrelated to this business, answer briefly and steer the conversation back to our products and services.
- Keep every reply to 2-3 sentences.
- Only use the facts listed above. If the answer is not there, say you will check with the team. Never invent prices, products, schedules or policies.";

const DEFAULT_TONE: &str = "friendly and helpful";

/// Render a knowledge snapshot into the system prompt. Pure and deterministic.
pub fn build_system_prompt(snapshot: &KnowledgeSnapshot) -> String {
    let mut out = String::new();
    let tone = if snapshot.tone.trim().is_empty() {
        DEFAULT_TONE
    } else {
        snapshot.tone.trim()
    };

    let _ = writeln!(
        out,
        "You are the customer service assistant for {}.",
        snapshot.business_name
    );
    let _ = writeln!(out, "Tone: {tone}");

    if !snapshot.faqs.is_empty() {
        out.push_str("\nFrequently asked questions:\n");
        for (i, faq) in snapshot.faqs.iter().enumerate() {
            let _ = writeln!(out, "{}. Q: {}", i + 1, faq.question);
            let _ = writeln!(out, "   A: {}", faq.answer);
        }
    }

    if !snapshot.products.is_empty() {
        out.push_str("\nProducts and prices:\n");
        for (i, product) in snapshot.products.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}. {} - {}",
                i + 1,
                product.name,
                format_price(product.price)
            );
        }
    }

    if !snapshot.entries.is_empty() {
        out.push_str("\nAdditional information:\n");
        for entry in &snapshot.entries {
            let _ = writeln!(out, "### {} ({})", entry.title, entry.entry_type);
            out.push_str(&render_content(&entry.content));
            out.push('\n');
        }
    }

    if !snapshot.relevant_context.trim().is_empty() {
        out.push('\n');
        out.push_str(snapshot.relevant_context.trim_end());
        out.push('\n');
    }

    out.push('\n');
    out.push_str(BEHAVIOR_INSTRUCTIONS);
    out
}

/// Format semantic search hits for a prompt.
///
/// Hits below `min_score` are dropped. Remaining hits are rendered in descending score
/// order, each in the layout of its document type. Returns an empty string when nothing
/// clears the threshold.
pub fn format_relevant_context(results: &[SearchResult], min_score: f32) -> String {
    let mut relevant: Vec<&SearchResult> =
        results.iter().filter(|r| r.score >= min_score).collect();
    if relevant.is_empty() {
        return String::new();
    }
    relevant.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut out = String::from("Relevant information:\n");
    for result in relevant {
        match result.doc_type.as_str() {
            DOC_TYPE_FAQ => {
                let question = metadata_str(result, "question").unwrap_or(&result.text);
                let answer = metadata_str(result, "answer").unwrap_or(&result.text);
                let _ = writeln!(out, "[FAQ]\nQ: {question}\nA: {answer}\n");
            }
            DOC_TYPE_PRODUCT => {
                let name = metadata_str(result, "name").unwrap_or(&result.doc_id);
                let description = metadata_str(result, "description").unwrap_or(&result.text);
                let _ = writeln!(out, "[Product] {name}");
                let _ = writeln!(out, "Description: {description}");
                if let Some(price) = result.metadata.get("price").and_then(Value::as_f64) {
                    let _ = writeln!(out, "Price: {}", format_price(price));
                }
                out.push('\n');
            }
            other => {
                let _ = writeln!(
                    out,
                    "[{other}] (relevance {:.2})\n{}\n",
                    result.score, result.text
                );
            }
        }
    }
    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}

fn format_price(price: f64) -> String {
    format!("Rp {:.0}", price.round())
}

fn render_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => format!("{s}\n"),
        other => match serde_json::to_string_pretty(other) {
            Ok(s) => format!("{s}\n"),
            Err(_) => format!("{other}\n"),
        },
    }
}

fn metadata_str<'a>(result: &'a SearchResult, key: &str) -> Option<&'a str> {
    result
        .metadata
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
