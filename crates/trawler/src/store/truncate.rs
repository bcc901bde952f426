//! Result truncation: keep stored job results under the per-document budget.
//!
//! Oversized results are reshaped rather than rejected, so a terminal
//! transition is never lost to a fat payload. The truncated shape keeps
//! enough of each document for clients to see what happened:
//! `{success, message?, truncated: true, originalSize, docs: [...]}` with
//! per-document content cut down and marked.

use serde_json::{json, Value};

use crate::models::ScrapeOutcome;

/// Suffix appended to every cut-down content field.
pub const TRUNCATION_MARKER: &str = "... (content truncated)";

/// Serialized-size slack reserved for the truncation bookkeeping fields.
const SHAPE_OVERHEAD: usize = 512;

/// Serialize an outcome, truncating it if the result would exceed
/// `max_bytes`. The returned value always serializes to at most
/// `max_bytes` bytes.
pub fn bounded_result(outcome: &ScrapeOutcome, max_bytes: usize) -> Value {
    let full = match serde_json::to_value(outcome) {
        Ok(v) => v,
        Err(_) => return minimal_shape(outcome, 0),
    };
    let original_size = serialized_len(&full);
    if original_size <= max_bytes {
        return full;
    }

    let truncated = truncated_shape(outcome, original_size, max_bytes);
    if serialized_len(&truncated) <= max_bytes {
        return truncated;
    }
    // Even the cut-down docs did not fit (pathological metadata sizes).
    minimal_shape(outcome, original_size)
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(usize::MAX)
}

fn truncated_shape(outcome: &ScrapeOutcome, original_size: usize, max_bytes: usize) -> Value {
    let mut docs: Vec<Value> = outcome
        .docs
        .iter()
        .filter_map(|doc| serde_json::to_value(doc).ok())
        .collect();

    // Measure everything except the contents, then split the remaining
    // byte budget evenly across the documents that carry content.
    let mut skeleton = docs.clone();
    for doc in &mut skeleton {
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("content");
            obj.remove("raw_html");
            obj.remove("markdown");
        }
    }
    let overhead = serialized_len(&json!({
        "success": outcome.success,
        "message": outcome.message,
        "truncated": true,
        "originalSize": original_size,
        "docs": skeleton,
    })) + SHAPE_OVERHEAD;

    let budget = max_bytes.saturating_sub(overhead);
    let with_content = docs
        .iter()
        .filter(|d| d.get("content").and_then(Value::as_str).is_some())
        .count()
        .max(1);
    let per_doc = budget / with_content;

    for doc in &mut docs {
        let Some(obj) = doc.as_object_mut() else { continue };
        // Bulky renditions are dropped outright; content is cut to fit.
        obj.remove("raw_html");
        obj.remove("markdown");
        let Some(content) = obj.get("content").and_then(Value::as_str) else {
            continue;
        };
        if content.len() <= per_doc {
            continue;
        }
        let keep = per_doc.saturating_sub(TRUNCATION_MARKER.len());
        let cut = truncate_at_char_boundary(content, keep);
        let original_content_length = content.len();
        obj.insert(
            "content".to_string(),
            Value::String(format!("{cut}{TRUNCATION_MARKER}")),
        );
        obj.insert("contentTruncated".to_string(), Value::Bool(true));
        obj.insert(
            "originalContentLength".to_string(),
            json!(original_content_length),
        );
    }

    json!({
        "success": outcome.success,
        "message": outcome.message,
        "truncated": true,
        "originalSize": original_size,
        "docs": docs,
    })
}

fn minimal_shape(outcome: &ScrapeOutcome, original_size: usize) -> Value {
    json!({
        "success": outcome.success,
        "message": "result too large to store",
        "truncated": true,
        "originalSize": original_size,
        "docs": [],
    })
}

fn truncate_at_char_boundary(s: &str, mut at: usize) -> &str {
    if at >= s.len() {
        return s;
    }
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    &s[..at]
}
